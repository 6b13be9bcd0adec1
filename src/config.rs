//! Functions and structures related to configuring a load test.
//!
//! Stampede is configured at run time by passing in the options and flags defined by the
//! [`StampedeConfiguration`] structure. The shape of the load test itself (users,
//! iterations, actions) lives in the [`TestPlan`](../test_plan/struct.TestPlan.html).

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;
use std::time::Duration;

use crate::logger::LogFormat;
use crate::test_plan::TestPlan;
use crate::util;
use crate::StampedeError;

/// Number of workers when neither `--concurrency` nor the test plan sets one.
pub const DEFAULT_CONCURRENCY: usize = 20;
/// Capacity of the task queue.
pub const DEFAULT_QUEUE_SIZE: usize = 1_000;
/// Capacity of the results queue.
pub const DEFAULT_RESULTS_QUEUE_SIZE: usize = 10_000;
/// Seconds before a request, connect or TCP exchange times out.
pub const DEFAULT_TIMEOUT: f64 = 60.0;

/// Runtime options available when launching a load test.
///
/// Stampede leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive help from the
/// structure below.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Stampede replays scripted HTTP, HTTPS and TCP actions with many virtual users.

Usage: stampede [OPTIONS] PLAN

The following runtime options are available:"#
)]
pub struct StampedeConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V", help = "Prints version information\n")]
    pub version: bool,

    /// The YAML test plan to run
    #[options(free)]
    pub plan: Vec<String>,

    /// Sets how many actions execute at once (default: 20)
    #[options(short = "c", meta = "VALUE")]
    pub concurrency: Option<usize>,
    /// Sets how many tasks can wait to execute (default: 1,000)
    #[options(no_short, meta = "VALUE")]
    pub queue_size: Option<usize>,
    /// Sets how many outcome records can wait to be processed (default: 10,000)
    #[options(no_short, meta = "VALUE")]
    pub results_queue_size: Option<usize>,
    /// Sets per-request timeout, in seconds (default: 60)
    #[options(
        no_short,
        meta = "VALUE",
        // Add a blank line and then a 'Logging:' header after this option
        help = "Sets per-request timeout, in seconds (default: 60)\n\nLogging:"
    )]
    pub timeout: Option<String>,

    /// Sets results log file name
    #[options(short = "R", meta = "NAME")]
    pub results_log: String,
    /// Sets results log format (json, csv, raw)
    #[options(no_short, meta = "FORMAT")]
    pub results_format: Option<LogFormat>,
    /// Enables log file and sets name
    #[options(no_short, meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        help = "Increases verbosity (-v, -vv, etc)\n\nMetrics:"
    )]
    pub verbose: u8,

    /// Doesn't display metrics at end of load test
    #[options(no_short)]
    pub no_print_metrics: bool,
    /// Displays a table of status codes
    #[options(no_short)]
    pub status_codes: bool,
}

impl StampedeConfiguration {
    /// The plan file named on the command line.
    pub fn plan_file(&self) -> Option<&str> {
        self.plan.first().map(|plan| plan.as_str())
    }

    /// How many workers execute actions: `--concurrency`, then the plan, then the default.
    pub fn concurrency(&self, plan: &TestPlan) -> usize {
        self.concurrency
            .or(plan.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY)
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE)
    }

    pub fn results_queue_size(&self) -> usize {
        self.results_queue_size.unwrap_or(DEFAULT_RESULTS_QUEUE_SIZE)
    }

    pub fn results_format(&self) -> LogFormat {
        self.results_format.unwrap_or_default()
    }

    /// The request timeout, invalid values having been rejected by `validate()`.
    pub fn timeout(&self) -> Duration {
        let seconds =
            util::get_float_from_string(self.timeout.clone()).unwrap_or(DEFAULT_TIMEOUT);
        match util::seconds_to_duration(seconds) {
            timeout if timeout.is_zero() => util::seconds_to_duration(DEFAULT_TIMEOUT),
            timeout => timeout,
        }
    }

    /// Reject options that can't be used together or at all.
    pub(crate) fn validate(&self) -> Result<(), StampedeError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        if self.plan.len() > 1 {
            return Err(StampedeError::InvalidOption {
                option: "PLAN".to_string(),
                value: self.plan.join(" "),
                detail: "Only one test plan can be run at a time.".to_string(),
            });
        }

        if self.concurrency == Some(0) {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.concurrency`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.concurrency` must be set to at least 1.".to_string(),
            });
        }

        if self.queue_size == Some(0) {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.queue_size`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.queue_size` must be set to at least 1.".to_string(),
            });
        }

        if self.results_queue_size == Some(0) {
            return Err(StampedeError::InvalidOption {
                option: "`configuration.results_queue_size`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.results_queue_size` must be set to at least 1."
                    .to_string(),
            });
        }

        // If set, timeout must be greater than zero.
        if let Some(timeout) = self.timeout.as_ref() {
            match util::get_float_from_string(Some(timeout.to_string())) {
                Some(seconds) if seconds.is_finite() && seconds > 0.0 => (),
                _ => {
                    return Err(StampedeError::InvalidOption {
                        option: "`configuration.timeout`".to_string(),
                        value: timeout.to_string(),
                        detail: "`configuration.timeout` must be a number greater than 0."
                            .to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Initialize the logger which writes to standard out and optionally to a log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        } else {
            None
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
        loggers.push(SimpleLogger::new(debug_level, Config::default()));
        if let Some(path) = log_file.as_ref() {
            match std::fs::File::create(path) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!("failed to create log file {}: {}", path.display(), e),
            }
        }

        match CombinedLogger::init(loggers) {
            Ok(_) => (),
            Err(e) => {
                info!("failed to initialize CombinedLogger: {}", e);
            }
        }
        if let Some(path) = log_file.as_ref() {
            info!("Writing to log file: {}", path.display());
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> StampedeConfiguration {
        StampedeConfiguration::parse_args_default(args).unwrap()
    }

    #[test]
    fn defaults() {
        let configuration = parse(&["plan.yaml"]);
        assert_eq!(configuration.plan_file(), Some("plan.yaml"));
        assert_eq!(configuration.queue_size(), DEFAULT_QUEUE_SIZE);
        assert_eq!(
            configuration.results_queue_size(),
            DEFAULT_RESULTS_QUEUE_SIZE
        );
        assert_eq!(configuration.timeout(), Duration::from_secs(60));
        assert_eq!(configuration.results_format(), LogFormat::Json);
        assert!(configuration.validate().is_ok());

        let plan = TestPlan::from_yaml(
            "users: 1\niterations: 1\nactions:\n  - tcp:\n      address: localhost:1\n",
        )
        .unwrap();
        assert_eq!(configuration.concurrency(&plan), DEFAULT_CONCURRENCY);
    }

    #[test]
    fn options() {
        let configuration = parse(&[
            "-c",
            "4",
            "--queue-size",
            "8",
            "--timeout",
            "2.5",
            "-R",
            "results.csv",
            "--results-format",
            "csv",
            "--status-codes",
            "-vv",
            "plan.yaml",
        ]);
        assert_eq!(configuration.concurrency, Some(4));
        assert_eq!(configuration.queue_size(), 8);
        assert_eq!(configuration.timeout(), Duration::from_millis(2500));
        assert_eq!(configuration.results_log, "results.csv");
        assert_eq!(configuration.results_format(), LogFormat::Csv);
        assert!(configuration.status_codes);
        assert_eq!(configuration.verbose, 2);
        assert!(configuration.validate().is_ok());

        // An unknown format is rejected while parsing.
        assert!(StampedeConfiguration::parse_args_default(&["--results-format", "xml"]).is_err());
    }

    #[test]
    fn concurrency_precedence() {
        let mut plan = TestPlan::from_yaml(
            "users: 1\niterations: 1\nconcurrency: 3\nactions:\n  - tcp:\n      address: localhost:1\n",
        )
        .unwrap();
        // The plan overrides the default.
        assert_eq!(parse(&[]).concurrency(&plan), 3);
        // The command line overrides the plan.
        assert_eq!(parse(&["-c", "7"]).concurrency(&plan), 7);
        plan.concurrency = None;
        assert_eq!(parse(&["-c", "7"]).concurrency(&plan), 7);
    }

    #[test]
    fn invalid_options() {
        assert!(parse(&["-v", "-q"]).validate().is_err());
        assert!(parse(&["-c", "0"]).validate().is_err());
        assert!(parse(&["--queue-size", "0"]).validate().is_err());
        assert!(parse(&["--results-queue-size", "0"]).validate().is_err());
        assert!(parse(&["--timeout", "0"]).validate().is_err());
        assert!(parse(&["--timeout=-1"]).validate().is_err());
        assert!(parse(&["--timeout", "soon"]).validate().is_err());
        assert!(parse(&["a.yaml", "b.yaml"]).validate().is_err());
    }
}
