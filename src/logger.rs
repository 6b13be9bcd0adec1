//! The optional results log.
//!
//! Enabled with the `--results-log` run-time option, the results log records every
//! [`OutcomeRecord`](../metrics/struct.OutcomeRecord.html) received by the results
//! consumer, one per line. The format is configured with `--results-format`:
//!  - `json` (default): one JSON object per line.
//!  - `csv`: a header row followed by one comma separated row per record.
//!  - `raw`: the debug representation of each record.
//!
//! The log is written through Tokio's asynchronous
//! [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html) and flushed when
//! the results consumer closes. Failures to write are logged and don't stop the load test.

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::metrics::OutcomeRecord;
use crate::StampedeError;

/// Column names of the csv results log, in the order the fields are written.
pub const CSV_HEADER: &str =
    "kind,title,user,iteration,offset_nanos,latency_nanos,size_bytes,status_code";

/// Supported results log formats.
#[derive(Clone, Copy, Debug, Default, Deserialize, EnumIter, Eq, PartialEq, Serialize)]
pub enum LogFormat {
    #[default]
    Json,
    Csv,
    Raw,
}
/// Allow `--results-format` from the command line using text variations on supported
/// `LogFormat`s by implementing [`FromStr`].
impl FromStr for LogFormat {
    type Err = StampedeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let log_format = RegexSet::new([
            r"(?i)^(js|json)$",
            r"(?i)^(csv|comma)$",
            r"(?i)^(raw|debug)$",
        ])
        .expect("failed to compile log_format RegexSet");
        let matches = log_format.matches(s);
        if matches.matched(0) {
            Ok(LogFormat::Json)
        } else if matches.matched(1) {
            Ok(LogFormat::Csv)
        } else if matches.matched(2) {
            Ok(LogFormat::Raw)
        } else {
            Err(StampedeError::InvalidOption {
                option: "--results-format".to_string(),
                value: s.to_string(),
                detail: format!(
                    "Invalid log format, expected one of: {}.",
                    LogFormat::iter()
                        .map(|format| format!("{:?}", format).to_lowercase())
                        .collect::<Vec<String>>()
                        .join(", ")
                ),
            })
        }
    }
}

/// Render one record as a single line in the requested format, without a newline.
pub fn format_record(record: &OutcomeRecord, format: LogFormat) -> String {
    match format {
        LogFormat::Json => match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to serialize {:?}: {}", record, e);
                String::new()
            }
        },
        LogFormat::Csv => {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .terminator(csv::Terminator::Any(b'\n'))
                .from_writer(Vec::new());
            let serialized = writer
                .serialize(record)
                .map_err(|e| e.to_string())
                .and_then(|_| writer.into_inner().map_err(|e| e.to_string()));
            match serialized {
                Ok(bytes) => String::from_utf8_lossy(&bytes).trim_end().to_string(),
                Err(e) => {
                    warn!("failed to serialize {:?}: {}", record, e);
                    String::new()
                }
            }
        }
        LogFormat::Raw => format!("{:?}", record),
    }
}

/// An open results log.
pub struct ResultsLog {
    path: PathBuf,
    format: LogFormat,
    writer: BufWriter<File>,
    lines: usize,
}
impl ResultsLog {
    /// Create (or truncate) the log file, creating parent directories as needed.
    pub async fn create<P: AsRef<Path>>(
        path: P,
        format: LogFormat,
    ) -> Result<ResultsLog, StampedeError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = File::create(&path).await?;
        info!("writing results log to {}", path.display());

        let mut results_log = ResultsLog {
            path,
            format,
            writer: BufWriter::new(file),
            lines: 0,
        };
        if format == LogFormat::Csv {
            results_log.write_line(CSV_HEADER).await;
        }
        Ok(results_log)
    }

    /// Append one record.
    pub async fn write(&mut self, record: &OutcomeRecord) {
        let line = format_record(record, self.format);
        if !line.is_empty() {
            self.write_line(&line).await;
        }
    }

    async fn write_line(&mut self, line: &str) {
        let result = match self.writer.write_all(line.as_bytes()).await {
            Ok(()) => self.writer.write_all(b"\n").await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.lines += 1,
            Err(e) => warn!("failed to write to {}: {}", self.path.display(), e),
        }
    }

    /// Flush everything buffered to disk.
    pub async fn flush(&mut self) {
        info!(
            "flushing {} lines to {}",
            self.lines,
            self.path.display()
        );
        if let Err(e) = self.writer.flush().await {
            warn!("failed to flush {}: {}", self.path.display(), e);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How many lines have been written, including the csv header.
    pub fn lines(&self) -> usize {
        self.lines
    }
}
