//! IPC between the controller and the out-of-process 3-D host.
//!
//! Length-prefixed JSON over `127.0.0.1` TCP connections.
//!
//! # Architecture
//!
//! - **Protocol**: request/response contracts and framing shared by both sides
//! - **Channel**: controller side; correlates responses to callers by request id
//! - **Server**: host side; accepts the controller and runs each request concurrently

pub mod channel;
pub mod protocol;
pub mod server;

pub use channel::{RequestPhase, ThreeDIpcChannel};
pub use protocol::{
    ResponseShape, ThreeDConfig, ThreeDErrorKind, ThreeDExecuteRequest, ThreeDExecuteResult,
    ThreeDIpcCommand, ThreeDIpcRequest, ThreeDIpcResponse, ThreeDMeasurement,
    ThreeDSaveAfterJudgementRequest, ThreeDStatus,
};
pub use server::{ThreeDCommandHandler, ThreeDIpcServer, ThreeDIpcServerHandle};
