//! Inspecta Core - engine plumbing for an inspection controller.
//!
//! The crate is headless: it defines the algorithm engine contract, an
//! explicit engine registry, manifest-driven plugin discovery, the built-in
//! engines, and the IPC stack that reaches the out-of-process 3-D host.
//!
//! # Example
//!
//! ```rust,ignore
//! use inspecta_core::{
//!     AlgorithmInput, CancellationToken, EngineDispatcher, EngineFactorySet, EngineRegistry,
//!     PluginLoader, ThreeDHost,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let host = Arc::new(ThreeDHost::new());
//!     let loader = PluginLoader::new(EngineFactorySet::builtin(host, Duration::from_secs(30)));
//!
//!     let registry = Arc::new(EngineRegistry::new());
//!     let discovery = loader.discover("plugins");
//!     for error in discovery.error_messages() {
//!         eprintln!("{}", error);
//!     }
//!     discovery.register_into(&registry);
//!
//!     let dispatcher = EngineDispatcher::new(registry);
//!     let input = AlgorithmInput::new("Housing").with_image("Gray", "gray.png");
//!     let result = dispatcher
//!         .dispatch("OpenCV", &input, &CancellationToken::new())
//!         .await;
//!     println!("{:?} ok={}", result.status, result.is_ok());
//! }
//! ```

pub mod algorithm;
pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod engines;
pub mod error;
pub mod ipc;
pub mod plugins;
pub mod registry;
pub mod three_d;

// Re-export commonly used types
pub use algorithm::{
    AlgorithmEngine, AlgorithmEngineDescriptor, AlgorithmInput, AlgorithmMeasurement,
    AlgorithmResult, DebugKeys, ExecutionStatus, ImageKeys, MeasurementLimits, ParamMap,
    PluginDescriptor,
};
pub use cancel::{CancellationToken, CancelledError};
pub use config::{EngineIds, InspectaSettings};
pub use dispatch::{DispatchJob, EngineDispatcher, EngineSelector, InspectionReport};
pub use error::{InspectaError, Result};
pub use ipc::{ThreeDIpcChannel, ThreeDIpcRequest, ThreeDIpcResponse};
pub use plugins::{EngineFactorySet, PluginDiscovery, PluginLoader};
pub use registry::{EnginePlugin, EngineRegistry};
pub use three_d::{HostLaunchConfig, ThreeDHost, ThreeDHostSupervisor};
