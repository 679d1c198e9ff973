//! Launching and supervising the 3-D host process.
//!
//! The host prints `IPC_PORT=<port>` on stdout once its server is listening.
//! The supervisor reads that line, connects, proves the host answers a
//! `GetStatus`, and only then attaches the channel. A watcher task owns the
//! child and detaches the channel the moment the process exits.

use super::host::ThreeDHost;
use crate::cancel::CancellationToken;
use crate::config::{HostConfig, InspectaSettings, IpcConfig};
use crate::error::{InspectaError, Result};
use crate::ipc::channel::ThreeDIpcChannel;
use crate::ipc::protocol::ThreeDIpcRequest;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// How to start the host executable.
#[derive(Debug, Clone)]
pub struct HostLaunchConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env_vars: HashMap<String, String>,
    /// Time allowed from spawn until the host answers `GetStatus`.
    pub ready_timeout: Duration,
}

impl HostLaunchConfig {
    pub fn new(executable: impl AsRef<Path>) -> Self {
        Self {
            executable: executable.as_ref().to_path_buf(),
            args: Vec::new(),
            env_vars: HashMap::new(),
            ready_timeout: HostConfig::READY_TIMEOUT,
        }
    }

    /// Build from settings. Without an explicit path the host is expected next
    /// to the running executable.
    pub fn from_settings(settings: &InspectaSettings) -> Result<Self> {
        let executable = match &settings.host_executable {
            Some(path) => path.clone(),
            None => Self::sibling_executable()?,
        };
        Ok(Self::new(executable)
            .with_args(settings.host_args.clone())
            .with_ready_timeout(settings.host_ready_timeout()))
    }

    fn sibling_executable() -> Result<PathBuf> {
        let current = std::env::current_exe().map_err(|e| InspectaError::HostLaunch {
            message: format!("cannot locate the running executable: {}", e),
        })?;
        let dir = current.parent().ok_or_else(|| InspectaError::HostLaunch {
            message: format!("{} has no parent directory", current.display()),
        })?;
        Ok(dir.join(format!(
            "{}{}",
            HostConfig::EXECUTABLE_NAME,
            std::env::consts::EXE_SUFFIX
        )))
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// A host process the supervisor started.
struct RunningHost {
    pid: Option<u32>,
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    exited_rx: Option<oneshot::Receiver<()>>,
}

/// Starts, watches, restarts and stops the 3-D host process.
pub struct ThreeDHostSupervisor {
    config: HostLaunchConfig,
    host: Arc<ThreeDHost>,
    running: Mutex<Option<RunningHost>>,
}

impl ThreeDHostSupervisor {
    pub fn new(config: HostLaunchConfig, host: Arc<ThreeDHost>) -> Self {
        Self {
            config,
            host,
            running: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &Arc<ThreeDHost> {
        &self.host
    }

    pub fn config(&self) -> &HostLaunchConfig {
        &self.config
    }

    /// Pid of the host process, while one is running.
    pub async fn pid(&self) -> Option<u32> {
        self.running.lock().await.as_ref().and_then(|r| r.pid)
    }

    /// Start the host and attach a verified channel.
    ///
    /// Any host started earlier by this supervisor is stopped first.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            self.stop_process(previous).await;
        }
        *running = Some(self.launch().await?);
        Ok(())
    }

    /// Restart the host when its channel is down. Returns whether a restart
    /// happened.
    pub async fn ensure_running(&self) -> Result<bool> {
        if self.host.is_available() {
            return Ok(false);
        }
        info!("3-D host unavailable; restarting");
        self.start().await?;
        Ok(true)
    }

    /// Ask the host to exit, killing it if it has not within the grace period.
    pub async fn shutdown(&self) {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            self.host.detach("supervisor shut down");
            return;
        };

        if self.host.is_available() {
            let response = self
                .host
                .call(
                    ThreeDIpcRequest::shutdown(),
                    HostConfig::SHUTDOWN_GRACE,
                    &CancellationToken::new(),
                )
                .await;
            match response {
                Ok(r) if r.success => debug!("3-D host acknowledged shutdown"),
                Ok(r) => warn!("3-D host refused shutdown: {}", r.error_text()),
                Err(e) => warn!("Failed to send shutdown to 3-D host: {}", e),
            }
        }

        self.stop_process(running).await;
    }

    async fn stop_process(&self, mut running: RunningHost) {
        self.host
            .detach_generation(running.generation, "3-D host stopping");

        let exited = match running.exited_rx.take() {
            Some(rx) => tokio::time::timeout(HostConfig::SHUTDOWN_GRACE, rx).await.is_ok(),
            None => true,
        };
        if exited {
            info!("3-D host (pid {:?}) exited", running.pid);
            return;
        }

        warn!(
            "3-D host (pid {:?}) did not exit within {:?}; killing",
            running.pid,
            HostConfig::SHUTDOWN_GRACE
        );
        if let Some(kill_tx) = running.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    async fn launch(&self) -> Result<RunningHost> {
        let mut command = Command::new(&self.config.executable);
        command
            .args(&self.config.args)
            .envs(&self.config.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!(
            "Starting 3-D host: {} {:?}",
            self.config.executable.display(),
            self.config.args
        );

        let mut child = command.spawn().map_err(|e| InspectaError::HostLaunch {
            message: format!("failed to spawn {}: {}", self.config.executable.display(), e),
        })?;
        let pid = child.id();

        let Some(stdout) = child.stdout.take() else {
            return Err(InspectaError::HostLaunch {
                message: "host stdout was not captured".to_string(),
            });
        };

        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        let ready = tokio::time::timeout_at(deadline, Self::handshake(stdout)).await;
        let (port, stdout_lines) = match ready {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                Self::abort_child(&mut child).await;
                return Err(e);
            }
            Err(_) => {
                Self::abort_child(&mut child).await;
                return Err(InspectaError::HostLaunch {
                    message: format!(
                        "host did not report its port within {:?}",
                        self.config.ready_timeout
                    ),
                });
            }
        };
        tokio::spawn(Self::drain_stdout(stdout_lines));

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let channel = match Self::verify(addr, deadline).await {
            Ok(channel) => channel,
            Err(e) => {
                Self::abort_child(&mut child).await;
                return Err(e);
            }
        };

        let generation = self.host.attach(channel);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        tokio::spawn(Self::watch_child(
            child,
            self.host.clone(),
            generation,
            kill_rx,
            exited_tx,
        ));

        info!("3-D host ready on {} (pid {:?})", addr, pid);
        Ok(RunningHost {
            pid,
            generation,
            kill_tx: Some(kill_tx),
            exited_rx: Some(exited_rx),
        })
    }

    /// Read stdout until the port line appears.
    async fn handshake(
        stdout: ChildStdout,
    ) -> Result<(u16, tokio::io::Lines<BufReader<ChildStdout>>)> {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = lines.next_line().await?.ok_or_else(|| InspectaError::HostLaunch {
                message: "host exited before reporting its port".to_string(),
            })?;
            if let Some(port) = parse_port_line(&line) {
                return Ok((port, lines));
            }
            debug!("3-D host stdout: {}", line);
        }
    }

    async fn drain_stdout(mut lines: tokio::io::Lines<BufReader<ChildStdout>>) {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("3-D host stdout: {}", line);
        }
    }

    /// Connect and prove the host answers before exposing the channel.
    async fn verify(addr: SocketAddr, deadline: tokio::time::Instant) -> Result<ThreeDIpcChannel> {
        let out_of_time = || InspectaError::HostLaunch {
            message: format!("host on {} did not answer before the ready deadline", addr),
        };
        let channel = tokio::time::timeout_at(deadline, ThreeDIpcChannel::connect(addr))
            .await
            .map_err(|_| out_of_time())??;
        let remaining = deadline
            .saturating_duration_since(tokio::time::Instant::now())
            .min(IpcConfig::STATUS_TIMEOUT);
        if remaining.is_zero() {
            return Err(out_of_time());
        }
        let response = channel
            .call(
                ThreeDIpcRequest::get_status(),
                remaining,
                &CancellationToken::new(),
            )
            .await?;
        if !response.success {
            return Err(InspectaError::HostLaunch {
                message: format!("readiness check failed: {}", response.error_text()),
            });
        }
        if let Some(status) = &response.status {
            if !status.is_initialized {
                warn!(
                    "3-D host is reachable but its SDK is not initialized: {}",
                    status.last_error.as_deref().unwrap_or("no reason given")
                );
            }
        }
        Ok(channel)
    }

    async fn watch_child(
        mut child: Child,
        host: Arc<ThreeDHost>,
        generation: u64,
        kill_rx: oneshot::Receiver<()>,
        exited_tx: oneshot::Sender<()>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Err(e) = child.start_kill() {
                    error!("Failed to kill 3-D host: {}", e);
                }
                child.wait().await
            }
        };

        let reason = match status {
            Ok(status) => format!("3-D host exited ({})", status),
            Err(e) => format!("3-D host wait failed: {}", e),
        };
        if host.detach_generation(generation, &reason) {
            warn!("{}", reason);
        } else {
            debug!("{}", reason);
        }
        let _ = exited_tx.send(());
    }

    async fn abort_child(child: &mut Child) {
        if let Err(e) = child.kill().await {
            debug!("Failed to kill unready 3-D host: {}", e);
        }
    }
}

/// Parse the `IPC_PORT=<port>` handshake line.
pub fn parse_port_line(line: &str) -> Option<u16> {
    line.trim()
        .strip_prefix(HostConfig::PORT_HANDSHAKE_PREFIX)
        .and_then(|port| port.trim().parse::<u16>().ok())
        .filter(|port| *port != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_line() {
        assert_eq!(parse_port_line("IPC_PORT=50123"), Some(50123));
        assert_eq!(parse_port_line("  IPC_PORT=80 \r"), Some(80));
        assert_eq!(parse_port_line("IPC_PORT=0"), None);
        assert_eq!(parse_port_line("IPC_PORT=abc"), None);
        assert_eq!(parse_port_line("starting up"), None);
    }

    #[test]
    fn test_launch_config_from_settings() {
        let settings = InspectaSettings {
            host_executable: Some(PathBuf::from("/opt/inspecta/inspecta-3d-host")),
            host_args: vec!["--simulate".to_string()],
            ..Default::default()
        };
        let config = HostLaunchConfig::from_settings(&settings).unwrap();
        assert_eq!(config.executable, PathBuf::from("/opt/inspecta/inspecta-3d-host"));
        assert_eq!(config.args, vec!["--simulate"]);
    }

    #[tokio::test]
    async fn test_verify_stays_within_ready_deadline() {
        use crate::ipc::ThreeDIpcServer;
        use crate::three_d::{SimulatedSdk, ThreeDHostService};

        let service = Arc::new(ThreeDHostService::new(SimulatedSdk::new()));
        let mut server = ThreeDIpcServer::start(service).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = ThreeDHostSupervisor::verify(server.addr(), started)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ready deadline"));
        assert!(started.elapsed() < IpcConfig::STATUS_TIMEOUT);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        let channel = ThreeDHostSupervisor::verify(server.addr(), deadline)
            .await
            .unwrap();
        assert!(channel.is_connected());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_missing_executable_fails_launch() {
        let host = Arc::new(ThreeDHost::new());
        let supervisor = ThreeDHostSupervisor::new(
            HostLaunchConfig::new("/nonexistent/inspecta-3d-host"),
            host.clone(),
        );

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, InspectaError::HostLaunch { .. }));
        assert!(!host.is_available());
        assert!(supervisor.pid().await.is_none());
    }
}
