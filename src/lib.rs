//! # Stampede
//!
//! Stampede is a load generation engine. It simulates many concurrent virtual users, each
//! replaying a scripted sequence of HTTP, HTTPS and TCP actions against a target system,
//! while bounding the number of actions actually in flight independently of the number of
//! simulated users, shaping dispatch to a configured rate, and collecting timing and
//! outcome statistics.
//!
//! ## Running a load test
//!
//! Load tests are described by a YAML [`TestPlan`](./test_plan/struct.TestPlan.html):
//!
//! ```yaml
//! users: 10
//! rampup: 5
//! iterations: 100
//! rate: 200
//! actions:
//!   - http:
//!       title: Front page
//!       method: GET
//!       url: http://localhost:8080/
//! ```
//!
//! Then run the `stampede` binary, passing in the plan:
//!
//! ```bash
//! $ stampede --concurrency 20 -R results.json plan.yaml
//! ```
//!
//! A test plan can also be run from Rust:
//!
//! ```rust,no_run
//! use stampede::prelude::*;
//!
//! fn main() -> Result<(), StampedeError> {
//!     let plan = TestPlan::load("plan.yaml")?;
//!     let metrics = Stampede::initialize_with_config(StampedeConfiguration::default())?
//!         .set_plan(plan)
//!         .execute()?;
//!     metrics.print();
//!
//!     Ok(())
//! }
//! ```
//!
//! ## How a load test runs
//!
//! Virtual users are launched one at a time, `rampup / users` seconds apart. Each user runs
//! its configured number of iterations, and each iteration submits one
//! [`Task`](./worker/struct.Task.html) per scripted action into a bounded queue. A fixed
//! pool of `concurrency` workers drains the queue, each worker first waiting for the
//! [`Throttle`](./throttle/struct.Throttle.html) to admit it, then executing the action and
//! sending one [`OutcomeRecord`](./metrics/struct.OutcomeRecord.html) to the results
//! consumer. The [`SessionState`](./session/struct.SessionState.html) of the user moves
//! into each task and is handed back when it completes, so the actions of an iteration
//! run strictly one after the other.
//!
//! Transport failures are recorded with a status code of 0 and the load test continues.
//! Configuration failures, including malformed extraction expressions and responses that
//! can't be decoded for extraction, stop the load test with a [`StampedeError`].

#[macro_use]
extern crate log;

pub mod action;
pub mod config;
pub mod extract;
pub mod feeder;
pub mod logger;
pub mod metrics;
pub mod prelude;
pub mod session;
pub mod test_plan;
pub mod throttle;
pub mod user;
pub mod util;
pub mod worker;

use chrono::prelude::*;
use std::sync::Arc;
use std::{fmt, io};
use tokio::runtime::Runtime;

use crate::action::{Action, ActionContext};
use crate::config::StampedeConfiguration;
use crate::feeder::Feeder;
use crate::logger::ResultsLog;
use crate::metrics::{ResultsMessage, StampedeMetrics};
use crate::test_plan::TestPlan;
use crate::user::UserContext;
use crate::worker::{CompletionBarrier, WorkerPool, WorkerShared};

/// An enumeration of all errors a [`Stampede`] can return.
#[derive(Debug)]
pub enum StampedeError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://docs.rs/tokio/*/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_yaml::Error`](https://docs.rs/serde_yaml/*/serde_yaml/struct.Error.html).
    Yaml(serde_yaml::Error),
    /// Wraps a [`csv::Error`](https://docs.rs/csv/*/csv/struct.Error.html).
    Csv(csv::Error),
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// The test plan can't be run.
    InvalidPlan {
        /// An explanation of the error.
        detail: String,
    },
    /// A JSONPath or XPath expression failed to compile.
    InvalidExpression {
        /// The expression that failed to compile.
        expression: String,
        /// An explanation of the error.
        detail: String,
    },
    /// A response body couldn't be decoded to evaluate an expression against it.
    Extraction {
        /// The expression being evaluated.
        expression: String,
        /// An explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl StampedeError {
    fn describe(&self) -> &str {
        match *self {
            StampedeError::Io(_) => "io::Error",
            StampedeError::Reqwest(_) => "reqwest::Error",
            StampedeError::TokioJoin(_) => "tokio::task::JoinError",
            StampedeError::Yaml(_) => "serde_yaml::Error",
            StampedeError::Csv(_) => "csv::Error",
            StampedeError::InvalidOption { .. } => "invalid option or value specified",
            StampedeError::InvalidPlan { .. } => "invalid test plan",
            StampedeError::InvalidExpression { .. } => "invalid extraction expression",
            StampedeError::Extraction { .. } => "failed to extract from response",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for StampedeError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StampedeError::Io(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::Reqwest(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::TokioJoin(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::Yaml(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::Csv(ref source) => {
                write!(f, "StampedeError: {} ({})", self.describe(), source)
            }
            StampedeError::InvalidOption {
                ref option,
                ref value,
                ref detail,
            } => write!(
                f,
                "StampedeError: {} ({} = {}: {})",
                self.describe(),
                option,
                value,
                detail
            ),
            StampedeError::InvalidPlan { ref detail } => {
                write!(f, "StampedeError: {} ({})", self.describe(), detail)
            }
            StampedeError::InvalidExpression {
                ref expression,
                ref detail,
            }
            | StampedeError::Extraction {
                ref expression,
                ref detail,
            } => write!(
                f,
                "StampedeError: {} (`{}`: {})",
                self.describe(),
                expression,
                detail
            ),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for StampedeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            StampedeError::Io(ref source) => Some(source),
            StampedeError::Reqwest(ref source) => Some(source),
            StampedeError::TokioJoin(ref source) => Some(source),
            StampedeError::Yaml(ref source) => Some(source),
            StampedeError::Csv(ref source) => Some(source),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for StampedeError {
    fn from(err: reqwest::Error) -> StampedeError {
        StampedeError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for StampedeError {
    fn from(err: io::Error) -> StampedeError {
        StampedeError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for StampedeError {
    fn from(err: tokio::task::JoinError) -> StampedeError {
        StampedeError::TokioJoin(err)
    }
}

/// Auto-convert YAML errors.
impl From<serde_yaml::Error> for StampedeError {
    fn from(err: serde_yaml::Error) -> StampedeError {
        StampedeError::Yaml(err)
    }
}

/// Auto-convert CSV errors.
impl From<csv::Error> for StampedeError {
    fn from(err: csv::Error) -> StampedeError {
        StampedeError::Csv(err)
    }
}

/// One load test: a configuration and the test plan it runs.
pub struct Stampede {
    /// Run-time options.
    configuration: StampedeConfiguration,
    /// A plan set programmatically, otherwise loaded from `configuration.plan`.
    plan: Option<TestPlan>,
}
impl Stampede {
    /// Load configuration from the command line and initialize a [`Stampede`].
    ///
    /// # Example
    /// ```rust,no_run
    /// use stampede::prelude::*;
    ///
    /// let stampede = Stampede::initialize();
    /// ```
    pub fn initialize() -> Result<Stampede, StampedeError> {
        use gumdrop::Options;

        Ok(Stampede {
            configuration: StampedeConfiguration::parse_args_default_or_exit(),
            plan: None,
        })
    }

    /// Initialize a [`Stampede`] with an already loaded configuration.
    ///
    /// This is generally used by tests.
    pub fn initialize_with_config(
        configuration: StampedeConfiguration,
    ) -> Result<Stampede, StampedeError> {
        Ok(Stampede {
            configuration,
            plan: None,
        })
    }

    /// Run `plan` instead of loading the plan file named on the command line.
    pub fn set_plan(mut self, plan: TestPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Validate everything, run the load test to completion and return the collected
    /// metrics.
    ///
    /// Blocks until every virtual user has completed every iteration and every submitted
    /// task has finished, or until a fatal error stops the load test.
    pub fn execute(mut self) -> Result<StampedeMetrics, StampedeError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        self.configuration.validate()?;
        self.configuration.initialize_logger();

        let plan = match self.plan.take() {
            Some(plan) => plan,
            None => match self.configuration.plan_file() {
                Some(path) => TestPlan::load(path)?,
                None => {
                    return Err(StampedeError::InvalidOption {
                        option: "PLAN".to_string(),
                        value: "".to_string(),
                        detail: "A test plan file must be specified.".to_string(),
                    });
                }
            },
        };
        let actions = plan.build_actions()?;

        // Feeder files are read before anything starts.
        let feeder = match plan.feeder.as_ref() {
            Some(spec) => Some(Feeder::from_csv(&spec.filename, spec.delimiter())?),
            None => None,
        };

        let rt = Runtime::new()?;
        rt.block_on(self.start(plan, actions, feeder))
    }

    // Runs the load test inside the runtime created by `execute`. Tasks still running
    // when this returns with an error are dropped together with the runtime.
    async fn start(
        self,
        plan: TestPlan,
        actions: Vec<Action>,
        feeder: Option<Feeder>,
    ) -> Result<StampedeMetrics, StampedeError> {
        let concurrency = self.configuration.concurrency(&plan);
        let started = Local::now();
        info!(
            "starting {} users, {} iterations each, {} actions per iteration",
            plan.users,
            plan.iterations,
            actions.len()
        );
        info!(
            "concurrency: {}, rate: {}, rampup: {}s",
            concurrency, plan.rate, plan.rampup
        );

        let context = Arc::new(ActionContext::new(self.configuration.timeout())?);

        // Start the results consumer first so no record is ever lost.
        let results_log = match self.configuration.results_log.as_str() {
            "" => None,
            path => Some(ResultsLog::create(path, self.configuration.results_format()).await?),
        };
        let (results_tx, results_rx) = flume::bounded(self.configuration.results_queue_size());
        let consumer = tokio::spawn(metrics::accept_results(results_rx, results_log));

        let (throttle, throttle_handle) = throttle::start(plan.rate);
        let (fatal_tx, fatal_rx) = flume::unbounded();
        let pool = WorkerPool::start(
            concurrency,
            self.configuration.queue_size(),
            WorkerShared::new(throttle, context.clone(), results_tx.clone(), fatal_tx),
        );

        let barrier = CompletionBarrier::new();
        let user_context = Arc::new(UserContext {
            iterations: plan.iterations,
            pacing: util::seconds_to_duration(plan.pacing()),
            actions: actions.into_iter().map(Arc::new).collect(),
            tasks: pool.sender(),
            feeder: feeder.map(Feeder::spawn),
            barrier: barrier.clone(),
        });
        let scheduler = user::launch_users(
            plan.users,
            util::seconds_to_duration(plan.stagger()),
            user_context,
        );

        // A fatal error from any worker stops the load test.
        let fatal = tokio::select! {
            biased;
            Ok(error) = fatal_rx.recv_async() => Some(error),
            _ = scheduler => fatal_rx.try_recv().ok(),
        };
        if let Some(error) = fatal {
            error!("stopping load test: {}", error);
            return Err(error);
        }
        info!("all users finished, {} tasks pending", barrier.pending());

        let peak_concurrency = pool.stop().await;
        if let Some(handle) = throttle_handle {
            if let Err(e) = handle.await {
                warn!("throttle failed to exit cleanly: {}", e);
            }
        }

        // Every worker is gone, close the results pipeline and collect the metrics.
        if results_tx.send_async(ResultsMessage::Close).await.is_err() {
            debug!("results consumer already closed");
        }
        drop(results_tx);
        let mut metrics = consumer.await?;

        metrics.started = Some(started);
        metrics.duration = context.started().elapsed().as_secs_f64();
        metrics.users = plan.users;
        metrics.iterations = plan.iterations;
        metrics.rate = plan.rate;
        metrics.concurrency = concurrency;
        metrics.peak_concurrency = peak_concurrency;
        metrics.display_metrics = !self.configuration.no_print_metrics;
        metrics.display_status_codes = self.configuration.status_codes;
        info!(
            "load test finished after {:.2}s with {} outcome records",
            metrics.duration, metrics.count
        );

        Ok(metrics)
    }
}

