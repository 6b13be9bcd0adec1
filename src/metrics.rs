//! Outcome records and the metrics aggregated from them.
//!
//! Every executed action produces exactly one [`OutcomeRecord`]. Workers send these
//! records over a bounded [`flume`](https://docs.rs/flume) channel to a single results
//! consumer ([`accept_results`]), which folds them into [`StampedeMetrics`] and optionally
//! appends them to a [`ResultsLog`](../logger/struct.ResultsLog.html). Aggregation happens
//! in the consumer so workers can spend all their time generating load.
//!
//! When [`Stampede::execute()`](../struct.Stampede.html#method.execute) completes it
//! returns the [`StampedeMetrics`]. Viewed with [`std::fmt::Display`] they render as
//! tables:
//!
//! ```text
//!  === PER ACTION METRICS ===
//!  ------------------------------------------------------------------------------
//!  Name                     | Kind |  # records |        # errors | rec/s  | err/s
//!  ------------------------------------------------------------------------------
//!  Login                    | HTTP |      1,000 |         3 (0%)  | 33.33  | 0.10
//! ```

use chrono::prelude::*;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::{fmt, time};

use crate::action::ActionKind;
use crate::logger::ResultsLog;
use crate::util;

/// The outcome of executing one action.
///
/// Transport failures are recorded with a `status_code` of 0 and a `size_bytes` of 0.
/// TCP exchanges that succeed are recorded with a `status_code` of 200.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Which protocol the action used.
    pub kind: ActionKind,
    /// The title of the action.
    pub title: String,
    /// Which virtual user executed the action, starting at 1.
    pub user: usize,
    /// Which iteration of the user the action was part of, starting at 1.
    pub iteration: usize,
    /// When the action started, in nanoseconds since the load test started.
    pub offset_nanos: u64,
    /// How long the action took, in nanoseconds.
    pub latency_nanos: u64,
    /// How many bytes were received.
    pub size_bytes: usize,
    /// The HTTP status code, 200 for successful TCP exchanges, 0 for transport failures.
    pub status_code: u16,
}
impl OutcomeRecord {
    pub fn new(
        kind: ActionKind,
        title: &str,
        user: usize,
        iteration: usize,
        offset: time::Duration,
    ) -> Self {
        OutcomeRecord {
            kind,
            title: title.to_string(),
            user,
            iteration,
            offset_nanos: util::duration_nanos(offset),
            latency_nanos: 0,
            size_bytes: 0,
            status_code: 0,
        }
    }

    pub fn set_latency(&mut self, latency: time::Duration) {
        self.latency_nanos = util::duration_nanos(latency);
    }

    pub fn set_status_code(&mut self, status_code: u16) {
        self.status_code = status_code;
    }

    pub fn set_size(&mut self, size_bytes: usize) {
        self.size_bytes = size_bytes;
    }

    /// Transport failures and HTTP error responses count as errors.
    pub fn is_error(&self) -> bool {
        self.status_code == 0 || self.status_code >= 400
    }
}

/// Messages accepted by the results consumer.
#[derive(Debug, Clone)]
pub enum ResultsMessage {
    /// One executed action.
    Outcome(OutcomeRecord),
    /// No more records will be sent.
    Close,
}

/// Metrics aggregated for all records sharing one action title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMetricAggregate {
    /// The title of the action.
    pub title: String,
    /// Which protocol the action uses.
    pub kind: ActionKind,
    /// How many records were received.
    pub count: usize,
    /// How many of them were errors.
    pub error_count: usize,
    /// Total bytes received.
    pub size_bytes: usize,
    /// Sum of all latencies, in nanoseconds.
    pub total_latency: u64,
    /// Fastest latency, in nanoseconds.
    pub min_latency: u64,
    /// Slowest latency, in nanoseconds.
    pub max_latency: u64,
    /// How many times each status code was recorded.
    pub status_code_counts: HashMap<u16, usize>,
    /// The slowest record seen.
    pub slowest: Option<OutcomeRecord>,
}
impl ActionMetricAggregate {
    pub(crate) fn new(title: &str, kind: ActionKind) -> Self {
        ActionMetricAggregate {
            title: title.to_string(),
            kind,
            count: 0,
            error_count: 0,
            size_bytes: 0,
            total_latency: 0,
            min_latency: 0,
            max_latency: 0,
            status_code_counts: HashMap::new(),
            slowest: None,
        }
    }

    /// Fold one record into the aggregate.
    pub(crate) fn record(&mut self, record: &OutcomeRecord) {
        self.count += 1;
        if record.is_error() {
            self.error_count += 1;
        }
        self.size_bytes += record.size_bytes;
        self.total_latency = self.total_latency.saturating_add(record.latency_nanos);
        self.min_latency = update_min_latency(self.min_latency, self.count, record.latency_nanos);
        self.max_latency = self.max_latency.max(record.latency_nanos);
        *self
            .status_code_counts
            .entry(record.status_code)
            .or_insert(0) += 1;

        let slower = match self.slowest.as_ref() {
            Some(slowest) => record.latency_nanos > slowest.latency_nanos,
            None => true,
        };
        if slower {
            self.slowest = Some(record.clone());
        }
    }

    /// Average latency in nanoseconds.
    pub fn average_latency(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_latency as f64 / self.count as f64
        }
    }
}

/// All metrics collected during a load test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StampedeMetrics {
    /// When the load test started.
    pub started: Option<DateTime<Local>>,
    /// How long the load test ran, in seconds.
    pub duration: f64,
    /// How many virtual users were launched.
    pub users: usize,
    /// How many iterations each user ran.
    pub iterations: usize,
    /// The configured maximum admissions per second, 0 when unthrottled.
    pub rate: usize,
    /// How many workers executed actions.
    pub concurrency: usize,
    /// The most actions that were ever executing at the same time.
    pub peak_concurrency: usize,
    /// How many records were received.
    pub count: usize,
    /// How many of them were errors.
    pub error_count: usize,
    /// Sum of all latencies, in nanoseconds.
    pub total_latency: u64,
    /// Fastest latency, in nanoseconds.
    pub min_latency: u64,
    /// Slowest latency, in nanoseconds.
    pub max_latency: u64,
    /// Per-action aggregates, keyed by title.
    pub actions: BTreeMap<String, ActionMetricAggregate>,
    /// Whether `print()` displays anything.
    pub display_metrics: bool,
    /// Whether the status code table is displayed.
    pub display_status_codes: bool,
}
impl StampedeMetrics {
    pub(crate) fn new() -> Self {
        StampedeMetrics {
            display_metrics: true,
            ..Default::default()
        }
    }

    /// Fold one record into the metrics.
    pub fn record(&mut self, record: &OutcomeRecord) {
        self.count += 1;
        if record.is_error() {
            self.error_count += 1;
        }
        self.total_latency = self.total_latency.saturating_add(record.latency_nanos);
        self.min_latency = update_min_latency(self.min_latency, self.count, record.latency_nanos);
        self.max_latency = self.max_latency.max(record.latency_nanos);
        self.actions
            .entry(record.title.to_string())
            .or_insert_with(|| ActionMetricAggregate::new(&record.title, record.kind))
            .record(record);
    }

    /// Average latency in nanoseconds.
    pub fn average_latency(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_latency as f64 / self.count as f64
        }
    }

    /// Display the final metrics, unless disabled with `--no-print-metrics`.
    pub fn print(&self) {
        if self.display_metrics {
            info!("printing final metrics after {:.2} seconds...", self.duration);
            print!("{}", self);
        }
    }

    fn fmt_overview(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            "\n === OVERVIEW ===\n ------------------------------------------------------------------------------"
        )?;
        if let Some(started) = self.started.as_ref() {
            writeln!(
                fmt,
                " {:<24} | {}",
                "Started",
                started.format("%Y-%m-%d %H:%M:%S")
            )?;
        }
        writeln!(fmt, " {:<24} | {:.2}s", "Duration", self.duration)?;
        writeln!(
            fmt,
            " {:<24} | {}",
            "Users",
            self.users.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            fmt,
            " {:<24} | {}",
            "Iterations",
            self.iterations.to_formatted_string(&Locale::en)
        )?;
        let rate = match self.rate {
            0 => "unthrottled".to_string(),
            rate => format!("{}/s", rate.to_formatted_string(&Locale::en)),
        };
        writeln!(fmt, " {:<24} | {}", "Rate", rate)?;
        writeln!(
            fmt,
            " {:<24} | {} (peak {})",
            "Concurrency",
            self.concurrency.to_formatted_string(&Locale::en),
            self.peak_concurrency.to_formatted_string(&Locale::en)
        )
    }

    fn fmt_actions(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.actions.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === PER ACTION METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>4} | {:>10} | {:>15} | {:>7} | {:>6}",
            "Name", "Kind", "# records", "# errors", "rec/s", "err/s"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (title, action) in &self.actions {
            self.fmt_action_row(
                fmt,
                title,
                &action.kind.to_string(),
                action.count,
                action.error_count,
            )?;
        }
        if self.actions.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+------+------------+-----------------+---------+-------"
            )?;
            self.fmt_action_row(fmt, "Aggregated", "", self.count, self.error_count)?;
        }
        Ok(())
    }

    fn fmt_action_row(
        &self,
        fmt: &mut fmt::Formatter,
        title: &str,
        kind: &str,
        count: usize,
        error_count: usize,
    ) -> fmt::Result {
        let error_percent = if count > 0 {
            error_count as f64 / count as f64 * 100.0
        } else {
            0.0
        };
        let (records, errors) = per_second_calculations(self.duration, count, error_count);
        writeln!(
            fmt,
            " {:<24} | {:>4} | {:>10} | {:>15} | {:>7.records_p$} | {:>6.errors_p$}",
            util::truncate_string(title, 24),
            kind,
            count.to_formatted_string(&Locale::en),
            format!(
                "{} ({}%)",
                error_count.to_formatted_string(&Locale::en),
                error_percent as usize
            ),
            records,
            errors,
            records_p = determine_precision(records),
            errors_p = determine_precision(errors),
        )
    }

    fn fmt_latency(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.actions.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>14} | {:>14} | {:>14}",
            "Name", "Avg (ms)", "Min (ms)", "Max (ms)"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (title, action) in &self.actions {
            writeln!(
                fmt,
                " {:<24} | {:>14.2} | {:>14.2} | {:>14.2}",
                util::truncate_string(title, 24),
                action.average_latency() / 1_000_000.0,
                util::nanos_to_millis(action.min_latency),
                util::nanos_to_millis(action.max_latency),
            )?;
        }
        if self.actions.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+----------------+----------------+----------------"
            )?;
            writeln!(
                fmt,
                " {:<24} | {:>14.2} | {:>14.2} | {:>14.2}",
                "Aggregated",
                self.average_latency() / 1_000_000.0,
                util::nanos_to_millis(self.min_latency),
                util::nanos_to_millis(self.max_latency),
            )?;
        }
        Ok(())
    }

    fn fmt_status_codes(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if !self.display_status_codes || self.actions.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<24} | {:>51} ", "Name", "Status codes")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let mut aggregated_status_code_counts: HashMap<u16, usize> = HashMap::new();
        for (title, action) in &self.actions {
            let codes = prepare_status_codes(
                &action.status_code_counts,
                &mut Some(&mut aggregated_status_code_counts),
            );
            writeln!(
                fmt,
                " {:<24} | {:>51}",
                util::truncate_string(title, 24),
                codes,
            )?;
        }
        writeln!(
            fmt,
            " -------------------------+----------------------------------------------------"
        )?;
        let codes = prepare_status_codes(&aggregated_status_code_counts, &mut None);
        writeln!(fmt, " {:<24} | {:>51} ", "Aggregated", codes)
    }

    fn fmt_slowest(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.actions.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>14} | {:>6} | {:>9} | {:>6} | {:>6}",
            "Slowest", "Latency (ms)", "User", "Iteration", "Status", "Offset"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        // Slowest first.
        for record in self
            .actions
            .values()
            .filter_map(|action| action.slowest.as_ref())
            .sorted_by(|a, b| b.latency_nanos.cmp(&a.latency_nanos))
        {
            writeln!(
                fmt,
                " {:<24} | {:>14.2} | {:>6} | {:>9} | {:>6} | {:>5.1}s",
                util::truncate_string(&record.title, 24),
                util::nanos_to_millis(record.latency_nanos),
                record.user,
                record.iteration,
                record.status_code,
                record.offset_nanos as f64 / 1_000_000_000.0,
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for StampedeMetrics {
    // Implement display of metrics with `{}` marker.
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_overview(fmt)?;
        self.fmt_actions(fmt)?;
        self.fmt_latency(fmt)?;
        self.fmt_status_codes(fmt)?;
        self.fmt_slowest(fmt)
    }
}

/// The results consumer: receive records until every producer is gone or a
/// [`ResultsMessage::Close`] arrives, then flush the log and return the metrics.
pub async fn accept_results(
    receiver: flume::Receiver<ResultsMessage>,
    mut results_log: Option<ResultsLog>,
) -> StampedeMetrics {
    let mut metrics = StampedeMetrics::new();
    while let Ok(message) = receiver.recv_async().await {
        match message {
            ResultsMessage::Outcome(record) => {
                trace!("received {:?}", record);
                metrics.record(&record);
                if let Some(log) = results_log.as_mut() {
                    log.write(&record).await;
                }
            }
            ResultsMessage::Close => {
                debug!("results consumer closing");
                break;
            }
        }
    }

    // Records queued behind a close message are still counted.
    for message in receiver.drain() {
        if let ResultsMessage::Outcome(record) = message {
            metrics.record(&record);
            if let Some(log) = results_log.as_mut() {
                log.write(&record).await;
            }
        }
    }

    if let Some(mut log) = results_log {
        log.flush().await;
    }
    metrics
}

// The first record always sets the minimum.
fn update_min_latency(current: u64, count: usize, latency: u64) -> u64 {
    if count == 1 {
        latency
    } else {
        current.min(latency)
    }
}

fn per_second_calculations(duration: f64, total: usize, errors: usize) -> (f64, f64) {
    if duration <= 0.0 {
        (0.0, 0.0)
    } else {
        (total as f64 / duration, errors as f64 / duration)
    }
}

fn determine_precision(value: f64) -> usize {
    if value < 1000.0 {
        2
    } else {
        0
    }
}

/// Render status code counts as `"1,000 [200], 3 [0]"`, optionally adding them to a
/// running aggregate.
fn prepare_status_codes(
    status_code_counts: &HashMap<u16, usize>,
    aggregate_counts: &mut Option<&mut HashMap<u16, usize>>,
) -> String {
    let mut codes = Vec::new();
    for (status_code, count) in status_code_counts.iter().sorted() {
        codes.push(format!(
            "{} [{}]",
            count.to_formatted_string(&Locale::en),
            status_code
        ));
        if let Some(aggregate_status_code_counts) = aggregate_counts.as_mut() {
            *aggregate_status_code_counts.entry(*status_code).or_insert(0) += *count;
        }
    }
    codes.join(", ")
}
