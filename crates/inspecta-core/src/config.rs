//! Centralized configuration for Inspecta.
//!
//! Constant groups live on unit structs the same way throughout the crate.
//! [`InspectaSettings`] is the deployment file read by the composition root.

use crate::error::{InspectaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Stable engine identifiers shared by configuration, UI, and IPC.
pub struct EngineIds;

impl EngineIds {
    pub const VM: &'static str = "VM";
    pub const OPENCV: &'static str = "OpenCV";
    pub const ONNX: &'static str = "ONNX";
    pub const THREE_D: &'static str = "3D";
}

/// IPC framing and timing limits.
pub struct IpcConfig;

impl IpcConfig {
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
    pub const OUTBOUND_QUEUE_DEPTH: usize = 64;
    pub const MAX_CONNECTIONS: usize = 8;
}

/// 3-D host process lifecycle.
pub struct HostConfig;

impl HostConfig {
    /// Line prefix the host prints on stdout once its IPC server is bound.
    pub const PORT_HANDSHAKE_PREFIX: &'static str = "IPC_PORT=";
    pub const READY_TIMEOUT: Duration = Duration::from_secs(20);
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
    pub const EXECUTABLE_NAME: &'static str = "inspecta-3d-host";
}

/// Plugin directory conventions.
pub struct PluginConfig;

impl PluginConfig {
    pub const MANIFEST_EXTENSION: &'static str = "json";
    pub const NESTED_MANIFEST_NAME: &'static str = "plugin.json";
    pub const MAX_SCAN_DEPTH: usize = 2;
}

/// Deployment settings for the composition root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InspectaSettings {
    /// Directory scanned for plugin manifests.
    pub plugins_dir: PathBuf,
    /// Engine used when a template has no override.
    pub default_engine: String,
    /// Template name to engine id overrides.
    pub template_engines: HashMap<String, String>,
    /// Path to the 3-D host executable; `None` disables the host.
    pub host_executable: Option<PathBuf>,
    /// Extra arguments passed to the host executable.
    pub host_args: Vec<String>,
    /// Start the 3-D host during composition.
    pub auto_start_host: bool,
    /// Per-call timeout for 3-D IPC requests, in milliseconds.
    pub ipc_timeout_ms: u64,
    /// Time allowed for the host to print its port and answer `GetStatus`.
    pub host_ready_timeout_ms: u64,
}

impl Default for InspectaSettings {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            default_engine: EngineIds::OPENCV.to_string(),
            template_engines: HashMap::new(),
            host_executable: None,
            host_args: Vec::new(),
            auto_start_host: false,
            ipc_timeout_ms: IpcConfig::DEFAULT_CALL_TIMEOUT.as_millis() as u64,
            host_ready_timeout_ms: HostConfig::READY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl InspectaSettings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| InspectaError::io_with_path(e, path))?;
        let settings: Self = serde_json::from_str(&content).map_err(|e| InspectaError::Json {
            message: format!("Failed to parse settings from {}: {}", path.display(), e),
            source: Some(e),
        })?;
        settings.validate()?;

        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Reject settings the composition root cannot act on.
    pub fn validate(&self) -> Result<()> {
        if self.default_engine.trim().is_empty() {
            return Err(InspectaError::Validation {
                field: "defaultEngine".to_string(),
                message: "engine id must not be empty".to_string(),
            });
        }
        if let Some((template, _)) = self
            .template_engines
            .iter()
            .find(|(_, engine)| engine.trim().is_empty())
        {
            return Err(InspectaError::Validation {
                field: "templateEngines".to_string(),
                message: format!("template '{}' maps to an empty engine id", template),
            });
        }
        if self.ipc_timeout_ms == 0 {
            return Err(InspectaError::Validation {
                field: "ipcTimeoutMs".to_string(),
                message: "timeout must be greater than zero".to_string(),
            });
        }
        if self.host_ready_timeout_ms == 0 {
            return Err(InspectaError::Validation {
                field: "hostReadyTimeoutMs".to_string(),
                message: "timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn ipc_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_timeout_ms)
    }

    pub fn host_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.host_ready_timeout_ms)
    }
}
