//! Correlating IPC client channel to the 3-D host.
//!
//! One channel owns one connection. Requests are written by a writer task and
//! responses are read by a reader task; responses are matched to waiting
//! callers solely by `request_id`, so they may arrive in any order.
//!
//! # Request lifecycle
//!
//! `Created -> Sent -> AwaitingResponse -> (Matched | TimedOut | ChannelFaulted)`
//!
//! A caller always gets exactly one [`ThreeDIpcResponse`] back: the host's
//! answer, or a synthesized failure for timeout, cancellation, or a faulted
//! channel. After a fault every outstanding caller is released at once and new
//! calls fail fast until a new channel is connected.

use super::protocol::{
    decode, encode, read_frame, write_frame, ResponseHeader, ThreeDErrorKind, ThreeDIpcRequest,
    ThreeDIpcResponse,
};
use crate::cancel::CancellationToken;
use crate::config::IpcConfig;
use crate::error::{InspectaError, Result};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Phase of a request, used in trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Created,
    Sent,
    AwaitingResponse,
    Matched,
    TimedOut,
    Cancelled,
    ChannelFaulted,
}

/// Upper bound on remembered abandoned ids before the set is reset.
const MAX_ABANDONED_IDS: usize = 4096;

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<Uuid, oneshot::Sender<ThreeDIpcResponse>>,
    /// Ids whose callers gave up (timeout or cancellation).
    abandoned: HashSet<Uuid>,
    /// Fire-and-forget requests whose answers are dropped quietly.
    notices: HashSet<Uuid>,
    fault: Option<String>,
}

/// What the reader should do with an incoming response.
enum Delivery {
    Waiter(oneshot::Sender<ThreeDIpcResponse>),
    Notice,
    Late,
    Unknown,
}

struct ChannelShared {
    table: Mutex<PendingTable>,
    connected: AtomicBool,
    late_responses: AtomicU64,
    label: String,
}

impl ChannelShared {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert a waiter, unless the channel has already faulted.
    fn register(&self, id: Uuid) -> std::result::Result<oneshot::Receiver<ThreeDIpcResponse>, String> {
        let mut table = self.lock();
        if let Some(reason) = &table.fault {
            return Err(reason.clone());
        }
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(id, tx);
        Ok(rx)
    }

    fn register_notice(&self, id: Uuid) -> bool {
        let mut table = self.lock();
        if table.fault.is_some() {
            return false;
        }
        table.notices.insert(id);
        true
    }

    /// Remove a waiter the caller is giving up on. Returns false when the
    /// reader already claimed it.
    fn abandon(&self, id: Uuid) -> bool {
        let mut table = self.lock();
        let removed = table.waiters.remove(&id).is_some();
        if removed {
            if table.abandoned.len() >= MAX_ABANDONED_IDS {
                debug!("[{}] Resetting abandoned-id set", self.label);
                table.abandoned.clear();
            }
            table.abandoned.insert(id);
        }
        removed
    }

    fn claim(&self, id: Uuid) -> Delivery {
        let mut table = self.lock();
        if let Some(tx) = table.waiters.remove(&id) {
            Delivery::Waiter(tx)
        } else if table.notices.remove(&id) {
            Delivery::Notice
        } else if table.abandoned.remove(&id) {
            Delivery::Late
        } else {
            Delivery::Unknown
        }
    }

    /// Mark the channel faulted and release every outstanding caller.
    fn fault(&self, reason: &str) {
        let drained: Vec<(Uuid, oneshot::Sender<ThreeDIpcResponse>)> = {
            let mut table = self.lock();
            if table.fault.is_some() {
                return;
            }
            table.fault = Some(reason.to_string());
            table.notices.clear();
            table.waiters.drain().collect()
        };
        self.connected.store(false, Ordering::SeqCst);

        if drained.is_empty() {
            info!("[{}] IPC channel closed: {}", self.label, reason);
        } else {
            warn!(
                "[{}] IPC channel faulted with {} outstanding request(s): {}",
                self.label,
                drained.len(),
                reason
            );
        }

        for (id, tx) in drained {
            debug!(request_id = %id, phase = ?RequestPhase::ChannelFaulted, "Releasing waiter");
            let _ = tx.send(ThreeDIpcResponse::failure(
                id,
                ThreeDErrorKind::ChannelFaulted,
                format!("3-D host channel faulted: {}", reason),
            ));
        }
    }

    fn fault_reason(&self) -> Option<String> {
        self.lock().fault.clone()
    }

    fn in_flight(&self) -> usize {
        self.lock().waiters.len()
    }

    fn record_late(&self, id: Uuid, known: bool) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
        if known {
            warn!(request_id = %id, "[{}] Discarding late response for an abandoned request", self.label);
        } else {
            warn!(request_id = %id, "[{}] Discarding response with unknown request id", self.label);
        }
    }
}

/// Client side of the 3-D host connection.
pub struct ThreeDIpcChannel {
    shared: Arc<ChannelShared>,
    outbound: mpsc::Sender<Vec<u8>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    peer: Option<SocketAddr>,
}

impl ThreeDIpcChannel {
    /// Connect to a host's IPC server over local TCP.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| InspectaError::Timeout(IpcConfig::CONNECT_TIMEOUT))?
            .map_err(|e| InspectaError::Ipc {
                message: format!("Failed to connect to 3-D host at {}: {}", addr, e),
            })?;
        stream.set_nodelay(true).ok();

        debug!("IPC channel connected to {}", addr);

        let mut channel = Self::from_stream(stream, addr.to_string());
        channel.peer = Some(addr);
        Ok(channel)
    }

    /// Run the channel over any duplex byte stream.
    pub fn from_stream<S>(stream: S, label: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(ChannelShared {
            table: Mutex::new(PendingTable::default()),
            connected: AtomicBool::new(true),
            late_responses: AtomicU64::new(0),
            label: label.into(),
        });
        let (outbound, outbound_rx) = mpsc::channel(IpcConfig::OUTBOUND_QUEUE_DEPTH);

        let reader_task = tokio::spawn(Self::read_loop(reader, shared.clone()));
        let writer_task = tokio::spawn(Self::write_loop(writer, outbound_rx, shared.clone()));

        Self {
            shared,
            outbound,
            reader_task,
            writer_task,
            peer: None,
        }
    }

    async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<ChannelShared>) {
        let reason = loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break "host closed the connection".to_string(),
                Err(e) => break format!("read failed: {}", e),
            };

            // A record that names its request id fails only that request.
            let response: ThreeDIpcResponse = match decode(&frame) {
                Ok(response) => response,
                Err(e) => match decode::<ResponseHeader>(&frame) {
                    Ok(header) => {
                        warn!(
                            request_id = %header.request_id,
                            "[{}] Undecodable response: {}", shared.label, e
                        );
                        ThreeDIpcResponse::failure(
                            header.request_id,
                            ThreeDErrorKind::ExecutionFailed,
                            format!("malformed response: {}", e),
                        )
                    }
                    Err(_) => break format!("malformed response: {}", e),
                },
            };

            let id = response.request_id;
            match shared.claim(id) {
                Delivery::Waiter(tx) => {
                    debug!(request_id = %id, phase = ?RequestPhase::Matched, "Response matched");
                    if tx.send(response).is_err() {
                        shared.record_late(id, true);
                    }
                }
                Delivery::Notice => {
                    debug!(request_id = %id, "Notice acknowledged by host");
                }
                Delivery::Late => shared.record_late(id, true),
                Delivery::Unknown => shared.record_late(id, false),
            }
        };
        shared.fault(&reason);
    }

    async fn write_loop<W: AsyncWrite + Unpin>(
        mut writer: W,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        shared: Arc<ChannelShared>,
    ) {
        while let Some(bytes) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &bytes).await {
                shared.fault(&format!("write failed: {}", e));
                return;
            }
        }
    }

    /// Send a request and wait for its correlated response.
    ///
    /// Returns `Err` only for caller programming errors (a payload that does
    /// not match the command). Every runtime failure is a synthesized
    /// response with `success = false` and an [`ThreeDErrorKind`].
    pub async fn call(
        &self,
        request: ThreeDIpcRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ThreeDIpcResponse> {
        request.validate()?;
        let id = request.request_id;
        let command = request.command;
        let bytes = encode(&request)?;
        drop(request);
        debug!(request_id = %id, %command, phase = ?RequestPhase::Created, "IPC request");

        if cancel.is_cancelled() {
            return Ok(ThreeDIpcResponse::failure(
                id,
                ThreeDErrorKind::Cancelled,
                "request cancelled before it was sent",
            ));
        }

        let mut rx = match self.shared.register(id) {
            Ok(rx) => rx,
            Err(reason) => {
                return Ok(ThreeDIpcResponse::failure(
                    id,
                    ThreeDErrorKind::ChannelFaulted,
                    format!("3-D host channel is down: {}", reason),
                ));
            }
        };

        let pending = PendingCall {
            channel: self,
            id,
            armed: true,
        };
        let deadline = tokio::time::Instant::now() + timeout;

        let exchange = async {
            if self.outbound.send(bytes).await.is_err() {
                return None;
            }
            debug!(request_id = %id, phase = ?RequestPhase::Sent, "IPC request written");
            debug!(request_id = %id, phase = ?RequestPhase::AwaitingResponse, "Waiting");
            (&mut rx).await.ok()
        };

        let response = tokio::select! {
            response = exchange => {
                response.unwrap_or_else(|| {
                    self.shared.abandon(id);
                    let reason = self
                        .shared
                        .fault_reason()
                        .unwrap_or_else(|| "writer stopped".to_string());
                    ThreeDIpcResponse::failure(
                        id,
                        ThreeDErrorKind::ChannelFaulted,
                        format!("3-D host channel faulted: {}", reason),
                    )
                })
            }
            _ = tokio::time::sleep_until(deadline) => {
                match self.rescue(id, &mut rx) {
                    Some(response) => response,
                    None => {
                        debug!(request_id = %id, phase = ?RequestPhase::TimedOut, "IPC request timed out");
                        ThreeDIpcResponse::failure(
                            id,
                            ThreeDErrorKind::Timeout,
                            format!("{} timed out after {} ms", command, timeout.as_millis()),
                        )
                    }
                }
            }
            _ = cancel.cancelled() => {
                match self.rescue(id, &mut rx) {
                    Some(response) => response,
                    None => {
                        debug!(request_id = %id, phase = ?RequestPhase::Cancelled, "IPC request cancelled");
                        self.notify_cancel(id);
                        ThreeDIpcResponse::failure(
                            id,
                            ThreeDErrorKind::Cancelled,
                            format!("{} cancelled by caller", command),
                        )
                    }
                }
            }
        };
        pending.finish();
        Ok(response)
    }

    /// Give up on a waiter. If the reader claimed it first, hand back the
    /// response it already delivered.
    fn rescue(
        &self,
        id: Uuid,
        rx: &mut oneshot::Receiver<ThreeDIpcResponse>,
    ) -> Option<ThreeDIpcResponse> {
        if self.shared.abandon(id) {
            None
        } else {
            rx.try_recv().ok()
        }
    }

    /// Tell the host a request was abandoned. Best effort: never waits.
    fn notify_cancel(&self, target: Uuid) {
        let notice = ThreeDIpcRequest::cancel(target);
        let notice_id = notice.request_id;
        let Ok(bytes) = encode(&notice) else {
            return;
        };
        if !self.shared.register_notice(notice_id) {
            return;
        }
        if self.outbound.try_send(bytes).is_err() {
            debug!(request_id = %target, "Cancel notice dropped; outbound queue unavailable");
            self.shared.claim(notice_id);
        }
    }

    /// True until the connection faults or is closed. Never blocks.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Why the channel went down, if it has.
    pub fn fault_reason(&self) -> Option<String> {
        self.shared.fault_reason()
    }

    /// Responses discarded because nobody was waiting for them anymore.
    pub fn late_responses(&self) -> u64 {
        self.shared.late_responses.load(Ordering::Relaxed)
    }

    /// Requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Fault the channel deliberately, releasing outstanding callers.
    pub fn close(&self, reason: &str) {
        self.shared.fault(reason);
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// Releases the pending entry of a `call` future dropped before it finished.
struct PendingCall<'a> {
    channel: &'a ThreeDIpcChannel,
    id: Uuid,
    armed: bool,
}

impl PendingCall<'_> {
    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.armed && self.channel.shared.abandon(self.id) {
            debug!(request_id = %self.id, phase = ?RequestPhase::Cancelled, "IPC call dropped by caller");
            self.channel.notify_cancel(self.id);
        }
    }
}

impl Drop for ThreeDIpcChannel {
    fn drop(&mut self) {
        self.shared.fault("channel dropped");
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl std::fmt::Debug for ThreeDIpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreeDIpcChannel")
            .field("label", &self.shared.label)
            .field("connected", &self.is_connected())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
