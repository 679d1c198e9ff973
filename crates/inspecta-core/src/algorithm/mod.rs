//! Algorithm contract layer.
//!
//! The data model shared by every engine ([`AlgorithmInput`],
//! [`AlgorithmMeasurement`], [`AlgorithmResult`]) and the [`AlgorithmEngine`]
//! capability interface. Nothing here depends on a concrete engine.

mod engine;
mod input;
mod measurement;
mod params;
mod result;

pub use engine::{AlgorithmEngine, AlgorithmEngineDescriptor, PluginDescriptor};
pub use input::{AlgorithmInput, ImageKeys};
pub use measurement::{AlgorithmMeasurement, MeasurementLimits, MeasurementTags};
pub use params::ParamMap;
pub use result::{AlgorithmResult, DebugKeys, ExecutionStatus};
