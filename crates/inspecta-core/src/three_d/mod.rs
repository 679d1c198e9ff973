//! The out-of-process 3-D host.
//!
//! The vendor 3-D SDK is isolated in its own process so a crash or hang there
//! never takes the controller down.
//!
//! - [`sdk`]: the blocking SDK seam and a simulated implementation
//! - [`service`]: host-side command handling
//! - [`host`]: controller-side handle to the current channel
//! - [`supervisor`]: starts, watches and restarts the host process

pub mod host;
pub mod sdk;
pub mod service;
pub mod supervisor;

pub use host::ThreeDHost;
pub use sdk::{SimulatedSdk, SimulationKeys, ThreeDSdk};
pub use service::ThreeDHostService;
pub use supervisor::{parse_port_line, HostLaunchConfig, ThreeDHostSupervisor};
