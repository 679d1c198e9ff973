//! Error types for Inspecta.
//!
//! These errors cover internal seams: file I/O, plugin manifests, IPC framing,
//! host process launch, and caller programming errors. Engine and dispatch
//! operations never surface them directly; they are folded into an
//! [`AlgorithmResult`](crate::algorithm::AlgorithmResult) or a
//! [`ThreeDIpcResponse`](crate::ipc::ThreeDIpcResponse) at the public boundary.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Inspecta core.
#[derive(Debug, Error)]
pub enum InspectaError {
    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Plugin errors
    #[error("Plugin manifest {path:?} rejected: {message}")]
    PluginLoad { path: PathBuf, message: String },

    #[error("Unknown engine kind '{kind}'")]
    UnknownEngineKind { kind: String },

    // IPC errors
    #[error("IPC error: {message}")]
    Ipc { message: String },

    #[error("Request {command} carries a mismatched payload: {message}")]
    PayloadMismatch { command: String, message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // Host process errors
    #[error("3-D host launch failed: {message}")]
    HostLaunch { message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Inspecta operations.
pub type Result<T> = std::result::Result<T, InspectaError>;

impl From<std::io::Error> for InspectaError {
    fn from(err: std::io::Error) -> Self {
        InspectaError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for InspectaError {
    fn from(err: serde_json::Error) -> Self {
        InspectaError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl InspectaError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        InspectaError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Check if this error should trigger a retry by the caller's policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InspectaError::Timeout(_) | InspectaError::Ipc { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InspectaError::UnknownEngineKind {
            kind: "halcon".into(),
        };
        assert_eq!(err.to_string(), "Unknown engine kind 'halcon'");
    }

    #[test]
    fn test_io_with_path_keeps_path() {
        let err = InspectaError::io_with_path(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "/plugins/a.json",
        );
        match err {
            InspectaError::Io { path, .. } => {
                assert_eq!(path, Some(PathBuf::from("/plugins/a.json")))
            }
            other => panic!("Expected Io, got: {:?}", other),
        }
    }

    #[test]
    fn test_plugin_load_display_names_manifest() {
        let err = InspectaError::PluginLoad {
            path: PathBuf::from("/plugins/line-3.json"),
            message: "manifest has an empty id".into(),
        };
        let text = err.to_string();
        assert!(text.contains("line-3.json"));
        assert!(text.contains("empty id"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(InspectaError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(InspectaError::Ipc {
            message: "connection refused".into()
        }
        .is_retryable());
        assert!(!InspectaError::Config {
            message: "bad".into()
        }
        .is_retryable());
    }
}
