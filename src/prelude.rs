pub use crate::config::StampedeConfiguration;
pub use crate::extract::Selection;
pub use crate::logger::LogFormat;
pub use crate::metrics::{OutcomeRecord, StampedeMetrics};
pub use crate::test_plan::TestPlan;
pub use crate::{Stampede, StampedeError};
