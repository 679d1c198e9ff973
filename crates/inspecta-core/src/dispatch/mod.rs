//! Engine dispatch and result aggregation.
//!
//! Callers resolve an engine id with [`EngineSelector`], run it through
//! [`EngineDispatcher`], and fold the results into an [`InspectionReport`].
//! Fallback to a different engine is left to the caller.

mod dispatcher;
mod report;
mod selector;

pub use dispatcher::{DispatchJob, EngineDispatcher};
pub use report::{EngineIssue, EngineMeasurement, InspectionReport};
pub use selector::EngineSelector;
