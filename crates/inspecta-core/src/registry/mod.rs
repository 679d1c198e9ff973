//! Engine registry.
//!
//! Maps stable engine ids (`VM`, `OpenCV`, `ONNX`, `3D`, ...) to the plugin
//! instance that answers them, so the host picks an engine per job without
//! compile-time coupling. The registry is an explicit instance owned by the
//! composition root; tests build their own.

pub mod engine_registry;

pub use engine_registry::{EnginePlugin, EngineRegistry};
