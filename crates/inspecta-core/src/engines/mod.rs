//! Built-in engines and the factories that construct them from manifests.
//!
//! - [`legacy`]: marks jobs for the vendor vision-master pipeline
//! - [`gray_level`]: in-process 2-D statistics on decoded images
//! - [`onnx`]: in-process classifier behind an inference backend
//! - [`three_d`]: adapter for the out-of-process 3-D host

pub mod gray_level;
pub mod legacy;
pub mod onnx;
pub mod three_d;

pub use gray_level::{analyze_gray, GrayLevelEngine, GrayLevelFactory, GrayStats};
pub use legacy::{LegacyVmEngine, LegacyVmFactory};
pub use onnx::{BackendLoader, InferenceBackend, OnnxEngine, OnnxFactory};
pub use three_d::{default_three_d_engine, ThreeDEngine, ThreeDFactory};
