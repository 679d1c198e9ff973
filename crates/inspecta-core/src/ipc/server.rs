//! TCP IPC server run inside the 3-D host process.
//!
//! Listens on `127.0.0.1` (OS-assigned port unless one is given), accepts
//! controller connections and hands each decoded request to a
//! [`ThreeDCommandHandler`].
//!
//! # Concurrency
//!
//! Each connection runs in its own task. Each request on a connection is
//! handled in a task of its own, and responses are funneled through a single
//! writer per connection, so a slow `ExecuteWithLocalImages` never blocks a
//! `GetStatus` sent after it.

use super::protocol::{
    decode, encode, read_frame, write_frame, ThreeDErrorKind, ThreeDIpcCommand,
    ThreeDIpcRequest, ThreeDIpcResponse,
};
use crate::config::IpcConfig;
use crate::error::Result;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handle to a running IPC server. Dropping shuts down the server.
pub struct ThreeDIpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    shutdown_requested_rx: watch::Receiver<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ThreeDIpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolve once a controller has sent a successful `Shutdown` command.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown_requested_rx.clone();
        // An Err means the accept loop is gone, which is as final as a request.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Stop accepting connections and close the active ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for ThreeDIpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Executes host commands on behalf of the server.
#[async_trait::async_trait]
pub trait ThreeDCommandHandler: Send + Sync + 'static {
    /// Produce the response for one validated request. The response must
    /// carry the request's id.
    async fn handle(&self, request: ThreeDIpcRequest) -> ThreeDIpcResponse;
}

/// IPC server for the 3-D host.
pub struct ThreeDIpcServer;

impl ThreeDIpcServer {
    /// Start on a random local port.
    pub async fn start<H: ThreeDCommandHandler>(handler: Arc<H>) -> Result<ThreeDIpcServerHandle> {
        Self::start_on(0, handler).await
    }

    /// Start on a specific local port; `0` lets the OS choose.
    pub async fn start_on<H: ThreeDCommandHandler>(
        port: u16,
        handler: Arc<H>,
    ) -> Result<ThreeDIpcServerHandle> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let addr = listener.local_addr()?;

        info!("3-D host IPC server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let (shutdown_requested_tx, shutdown_requested_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            handler,
            shutdown_rx,
            conn_shutdown_rx,
            Arc::new(shutdown_requested_tx),
            active_connections,
        ));

        Ok(ThreeDIpcServerHandle {
            addr,
            port: addr.port(),
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            shutdown_requested_rx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<H: ThreeDCommandHandler>(
        listener: TcpListener,
        handler: Arc<H>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        shutdown_requested: Arc<watch::Sender<bool>>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("3-D host IPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting IPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    IpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let handler = handler.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();
                            let shutdown_requested = shutdown_requested.clone();

                            tokio::spawn(async move {
                                debug!("IPC connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    handler,
                                    conn_shutdown,
                                    shutdown_requested,
                                )
                                .await
                                {
                                    debug!("IPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<H: ThreeDCommandHandler>(
        stream: TcpStream,
        handler: Arc<H>,
        mut shutdown_rx: watch::Receiver<bool>,
        shutdown_requested: Arc<watch::Sender<bool>>,
    ) -> Result<()> {
        stream.set_nodelay(true).ok();
        let (mut reader, mut writer) = stream.into_split();
        let (response_tx, mut response_rx) =
            mpsc::channel::<Vec<u8>>(IpcConfig::OUTBOUND_QUEUE_DEPTH);

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = response_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &bytes).await {
                    debug!("IPC response write failed: {}", e);
                    break;
                }
            }
        });

        let outcome = loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => break Ok(()),
            };

            let handler = handler.clone();
            let response_tx = response_tx.clone();
            let shutdown_requested = shutdown_requested.clone();
            tokio::spawn(async move {
                let (response, command) = Self::process_frame(&frame, handler.as_ref()).await;
                let bytes = match encode(&response) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Failed to encode IPC response: {}", e);
                        return;
                    }
                };
                if response_tx.send(bytes).await.is_err() {
                    debug!(request_id = %response.request_id, "Connection closed before response was sent");
                    return;
                }
                if command == Some(ThreeDIpcCommand::Shutdown) && response.success {
                    info!("Shutdown requested by controller");
                    shutdown_requested.send_replace(true);
                }
            });
        };

        // Let in-flight handlers finish writing; the writer exits once every
        // sender is gone.
        drop(response_tx);
        let _ = writer_task.await;
        outcome
    }

    async fn process_frame<H: ThreeDCommandHandler>(
        frame: &[u8],
        handler: &H,
    ) -> (ThreeDIpcResponse, Option<ThreeDIpcCommand>) {
        let request: ThreeDIpcRequest = match decode(frame) {
            Ok(request) => request,
            Err(e) => {
                let request_id = Self::salvage_request_id(frame);
                warn!(request_id = %request_id, "Rejecting malformed IPC request: {}", e);
                return (
                    ThreeDIpcResponse::failure(
                        request_id,
                        ThreeDErrorKind::InvalidRequest,
                        format!("Malformed request: {}", e),
                    ),
                    None,
                );
            }
        };

        let command = request.command;
        if let Err(e) = request.validate() {
            return (
                ThreeDIpcResponse::failure(
                    request.request_id,
                    ThreeDErrorKind::InvalidRequest,
                    e.to_string(),
                ),
                Some(command),
            );
        }

        let request_id = request.request_id;
        let mut response = handler.handle(request).await;
        if response.request_id != request_id {
            warn!(
                request_id = %request_id,
                "Handler answered with a different request id; correcting"
            );
            response.request_id = request_id;
        }
        (response, Some(command))
    }

    /// Best-effort recovery of the id from a frame that failed to decode,
    /// so the controller can still release the waiting caller.
    fn salvage_request_id(frame: &[u8]) -> Uuid {
        serde_json::from_slice::<serde_json::Value>(frame)
            .ok()
            .and_then(|value| {
                value
                    .get("requestId")
                    .and_then(|id| id.as_str())
                    .and_then(|id| Uuid::parse_str(id).ok())
            })
            .unwrap_or(Uuid::nil())
    }
}
