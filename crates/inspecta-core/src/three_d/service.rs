//! Host-side command handling on top of a [`ThreeDSdk`].

use super::sdk::ThreeDSdk;
use crate::ipc::protocol::{
    ThreeDErrorKind, ThreeDExecuteResult, ThreeDIpcCommand, ThreeDIpcRequest, ThreeDIpcResponse,
    ThreeDStatus,
};
use crate::ipc::server::ThreeDCommandHandler;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct HostState {
    initialized: bool,
    template_name: String,
    configured: bool,
    last_error: Option<String>,
    /// Executions currently inside the SDK.
    running: HashSet<Uuid>,
    /// Subset of `running` the controller abandoned.
    cancelled: HashSet<Uuid>,
}

/// Serves IPC commands by driving the SDK on blocking threads.
///
/// SDK panics and errors become `ExecutionFailed` responses; the host process
/// keeps running.
pub struct ThreeDHostService<S: ThreeDSdk> {
    sdk: Arc<S>,
    state: Mutex<HostState>,
}

impl<S: ThreeDSdk> ThreeDHostService<S> {
    pub fn new(sdk: S) -> Self {
        Self {
            sdk: Arc::new(sdk),
            state: Mutex::new(HostState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start the SDK. A failure is kept in the status and reported to every
    /// execution as `NotInitialized`.
    pub async fn initialize(&self) -> bool {
        let sdk = self.sdk.clone();
        let outcome = tokio::task::spawn_blocking(move || sdk.initialize()).await;
        let mut state = self.lock();
        match outcome {
            Ok(Ok(())) => {
                state.initialized = true;
                state.last_error = None;
                info!("3-D SDK {} initialized", self.sdk.version());
            }
            Ok(Err(e)) => {
                error!("3-D SDK initialization failed: {}", e);
                state.last_error = Some(e.to_string());
            }
            Err(join) => {
                error!("3-D SDK initialization panicked: {}", join);
                state.last_error = Some(format!("initialization panicked: {}", join));
            }
        }
        state.initialized
    }

    pub fn status(&self) -> ThreeDStatus {
        let state = self.lock();
        ThreeDStatus {
            is_initialized: state.initialized,
            is_configured: state.configured,
            sdk_version: self.sdk.version(),
            template_name: state.template_name.clone(),
            in_flight: u32::try_from(state.running.len()).unwrap_or(u32::MAX),
            last_error: state.last_error.clone(),
        }
    }

    fn record_error(&self, message: &str) {
        self.lock().last_error = Some(message.to_string());
    }

    /// Run a blocking SDK call, mapping errors and panics to a message.
    async fn run_sdk<T, F>(&self, what: &str, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> crate::error::Result<T> + Send + 'static,
    {
        let sdk = self.sdk.clone();
        let outcome = tokio::task::spawn_blocking(move || f(sdk.as_ref())).await;
        let message = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => format!("{} failed: {}", what, e),
            Err(join) if join.is_panic() => format!("{} panicked inside the 3-D SDK", what),
            Err(join) => format!("{} aborted: {}", what, join),
        };
        warn!("{}", message);
        self.record_error(&message);
        Err(message)
    }

    fn not_initialized(&self, request_id: Uuid) -> ThreeDIpcResponse {
        ThreeDIpcResponse::failure(
            request_id,
            ThreeDErrorKind::NotInitialized,
            self.lock()
                .last_error
                .clone()
                .unwrap_or_else(|| "3-D SDK is not initialized".to_string()),
        )
    }

    async fn configure(&self, request: ThreeDIpcRequest) -> ThreeDIpcResponse {
        let id = request.request_id;
        let Some(config) = request.config else {
            return ThreeDIpcResponse::failure(id, ThreeDErrorKind::InvalidRequest, "missing config");
        };
        if !self.lock().initialized {
            return self.not_initialized(id);
        }

        let template = config.template_name.clone();
        match self.run_sdk("Configure", move |sdk| sdk.configure(&config)).await {
            Ok(()) => {
                {
                    let mut state = self.lock();
                    state.configured = true;
                    state.template_name = template;
                }
                ThreeDIpcResponse::with_status(id, self.status())
            }
            Err(message) => ThreeDIpcResponse::failure(id, ThreeDErrorKind::ExecutionFailed, message),
        }
    }

    async fn execute(&self, request: ThreeDIpcRequest) -> ThreeDIpcResponse {
        let id = request.request_id;
        let Some(mut execute) = request.execute else {
            return ThreeDIpcResponse::failure(id, ThreeDErrorKind::InvalidRequest, "missing execute");
        };
        if !self.lock().initialized {
            return self.not_initialized(id);
        }
        if execute.template_name.is_empty() {
            execute.template_name = self.lock().template_name.clone();
        }

        self.lock().running.insert(id);
        debug!(request_id = %id, "Executing 3-D inspection for image {}", execute.image_id);
        let outcome = self
            .run_sdk("ExecuteWithLocalImages", move |sdk| sdk.execute(&execute))
            .await;
        let was_cancelled = {
            let mut state = self.lock();
            state.running.remove(&id);
            state.cancelled.remove(&id)
        };

        if was_cancelled {
            debug!(request_id = %id, "Execution finished after the controller cancelled it");
            return ThreeDIpcResponse::failure(
                id,
                ThreeDErrorKind::Cancelled,
                "execution cancelled by controller",
            );
        }

        match outcome {
            Ok(result) => ThreeDIpcResponse::with_result(id, sanitize(result)),
            Err(message) => ThreeDIpcResponse::failure(id, ThreeDErrorKind::ExecutionFailed, message),
        }
    }

    async fn save_after_judgement(&self, request: ThreeDIpcRequest) -> ThreeDIpcResponse {
        let id = request.request_id;
        let Some(save) = request.save_after_judgement else {
            return ThreeDIpcResponse::failure(
                id,
                ThreeDErrorKind::InvalidRequest,
                "missing saveAfterJudgement",
            );
        };
        if !self.lock().initialized {
            return self.not_initialized(id);
        }

        match self.run_sdk("SaveAfterJudgement", move |sdk| sdk.save_images(&save)).await {
            Ok(()) => ThreeDIpcResponse::with_status(id, self.status()),
            Err(message) => ThreeDIpcResponse::failure(id, ThreeDErrorKind::ExecutionFailed, message),
        }
    }

    fn cancel(&self, request: &ThreeDIpcRequest) -> ThreeDIpcResponse {
        if let Some(target) = request.cancel_target {
            let marked = {
                let mut state = self.lock();
                state.running.contains(&target) && state.cancelled.insert(target)
            };
            if marked {
                debug!(request_id = %target, "Controller cancelled running execution");
            } else {
                debug!(request_id = %target, "Cancel for an execution that is not running");
            }
        }
        ThreeDIpcResponse::with_status(request.request_id, self.status())
    }
}

/// Non-finite values cannot be judged; mark them invalid so the verdict is NG.
fn sanitize(mut result: ThreeDExecuteResult) -> ThreeDExecuteResult {
    for measurement in result.measurements.iter_mut() {
        if measurement.is_valid && !measurement.value.is_finite() {
            warn!("3-D SDK reported non-finite '{}'", measurement.name);
            measurement.is_valid = false;
        }
    }
    if result.measurements.iter().any(|m| !m.is_valid) {
        result.is_judge_all_ok = false;
    }
    result
}

#[async_trait::async_trait]
impl<S: ThreeDSdk> ThreeDCommandHandler for ThreeDHostService<S> {
    async fn handle(&self, request: ThreeDIpcRequest) -> ThreeDIpcResponse {
        match request.command {
            ThreeDIpcCommand::GetStatus => {
                ThreeDIpcResponse::with_status(request.request_id, self.status())
            }
            ThreeDIpcCommand::Configure => self.configure(request).await,
            ThreeDIpcCommand::ExecuteWithLocalImages => self.execute(request).await,
            ThreeDIpcCommand::SaveAfterJudgement => self.save_after_judgement(request).await,
            ThreeDIpcCommand::Cancel => self.cancel(&request),
            ThreeDIpcCommand::Shutdown => {
                info!("Shutdown command received");
                ThreeDIpcResponse::with_status(request.request_id, self.status())
            }
        }
    }
}
