//! Controller-side handle to the 3-D host connection.

use crate::cancel::CancellationToken;
use crate::config::IpcConfig;
use crate::error::Result;
use crate::ipc::channel::ThreeDIpcChannel;
use crate::ipc::protocol::{ThreeDErrorKind, ThreeDIpcRequest, ThreeDIpcResponse, ThreeDStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Default)]
struct Attachment {
    channel: Option<Arc<ThreeDIpcChannel>>,
    generation: u64,
}

/// Shared slot holding the current channel to the host, if any.
///
/// The supervisor attaches and detaches channels; engines only read.
/// [`is_available`](Self::is_available) never blocks on I/O.
#[derive(Default)]
pub struct ThreeDHost {
    attachment: RwLock<Attachment>,
    attached: AtomicBool,
    generations: AtomicU64,
}

impl ThreeDHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a connected channel. Returns its generation, used to detach
    /// exactly this attachment later.
    pub fn attach(&self, channel: ThreeDIpcChannel) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = {
            let mut attachment = match self.attachment.write() {
                Ok(a) => a,
                Err(poisoned) => poisoned.into_inner(),
            };
            attachment.generation = generation;
            attachment.channel.replace(Arc::new(channel))
        };
        self.attached.store(true, Ordering::SeqCst);
        if let Some(old) = previous {
            old.close("replaced by a new host connection");
        }
        info!("3-D host channel attached (generation {})", generation);
        generation
    }

    /// Drop the current channel, releasing any callers waiting on it.
    pub fn detach(&self, reason: &str) {
        self.detach_where(|_| true, reason);
    }

    /// Drop the channel only if it is still the given attachment.
    pub fn detach_generation(&self, generation: u64, reason: &str) -> bool {
        self.detach_where(|current| current == generation, reason)
    }

    fn detach_where(&self, matches: impl FnOnce(u64) -> bool, reason: &str) -> bool {
        let removed = {
            let mut attachment = match self.attachment.write() {
                Ok(a) => a,
                Err(poisoned) => poisoned.into_inner(),
            };
            if attachment.channel.is_none() || !matches(attachment.generation) {
                return false;
            }
            attachment.channel.take()
        };
        self.attached.store(false, Ordering::SeqCst);
        if let Some(channel) = removed {
            channel.close(reason);
            info!("3-D host channel detached: {}", reason);
        }
        true
    }

    pub fn channel(&self) -> Option<Arc<ThreeDIpcChannel>> {
        if !self.attached.load(Ordering::SeqCst) {
            return None;
        }
        match self.attachment.read() {
            Ok(a) => a.channel.clone(),
            Err(poisoned) => poisoned.into_inner().channel.clone(),
        }
    }

    /// True when a channel is attached and has not faulted.
    pub fn is_available(&self) -> bool {
        self.channel().is_some_and(|c| c.is_connected())
    }

    /// Send a request over the current channel.
    ///
    /// With no channel attached the caller gets a synthesized
    /// `ChannelFaulted` response instead of waiting.
    pub async fn call(
        &self,
        request: ThreeDIpcRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ThreeDIpcResponse> {
        let Some(channel) = self.channel() else {
            request.validate()?;
            debug!(request_id = %request.request_id, "No 3-D host attached");
            return Ok(ThreeDIpcResponse::failure(
                request.request_id,
                ThreeDErrorKind::ChannelFaulted,
                "3-D host is not running",
            ));
        };
        channel.call(request, timeout, cancel).await
    }

    /// `GetStatus` round-trip. `None` when the host did not answer successfully.
    pub async fn status(&self) -> Option<ThreeDStatus> {
        let response = self
            .call(
                ThreeDIpcRequest::get_status(),
                IpcConfig::STATUS_TIMEOUT,
                &CancellationToken::new(),
            )
            .await
            .ok()?;
        if response.success {
            response.status
        } else {
            None
        }
    }
}

impl std::fmt::Debug for ThreeDHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreeDHost")
            .field("available", &self.is_available())
            .finish()
    }
}
