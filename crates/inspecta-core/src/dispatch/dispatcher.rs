//! Execute one resolved engine and normalize what it returns.

use crate::algorithm::{AlgorithmEngine, AlgorithmInput, AlgorithmResult, ExecutionStatus};
use crate::cancel::CancellationToken;
use crate::registry::EngineRegistry;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One unit of work for [`EngineDispatcher::dispatch_all`].
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub engine_id: String,
    pub input: AlgorithmInput,
}

impl DispatchJob {
    pub fn new(engine_id: impl Into<String>, input: AlgorithmInput) -> Self {
        Self {
            engine_id: engine_id.into(),
            input,
        }
    }
}

/// Runs engines looked up in a registry.
///
/// An unknown or unavailable engine yields `NotAvailable` under the
/// requested id. No other engine is tried in its place, and no timeout is
/// added on top of what the engine enforces.
#[derive(Clone)]
pub struct EngineDispatcher {
    registry: Arc<EngineRegistry>,
}

impl EngineDispatcher {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Whether `engine_id` is registered and currently reports available.
    pub fn is_available(&self, engine_id: &str) -> bool {
        self.registry
            .get(engine_id)
            .is_some_and(|plugin| plugin.engine().is_available())
    }

    pub async fn dispatch(
        &self,
        engine_id: &str,
        input: &AlgorithmInput,
        cancel: &CancellationToken,
    ) -> AlgorithmResult {
        let started = Instant::now();
        let Some(plugin) = self.registry.get(engine_id) else {
            info!("Engine '{}' is not registered", engine_id);
            return AlgorithmResult::not_available(
                engine_id,
                format!("engine '{}' is not registered", engine_id),
            );
        };
        let engine = plugin.engine().clone();
        if !engine.is_available() {
            info!("Engine '{}' is registered but not available", engine_id);
            return AlgorithmResult::not_available(
                engine_id,
                format!("engine '{}' is not available", engine_id),
            )
            .with_version(engine.engine_version());
        }

        debug!(
            "Dispatching template '{}' image '{}' to engine '{}'",
            input.template_name, input.image_id, engine_id
        );
        let outcome = AssertUnwindSafe(engine.execute(input, cancel))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Engine '{}' panicked: {}", engine_id, message);
                AlgorithmResult::failed(engine_id, format!("engine panicked: {}", message))
            }
        };
        normalize(result, engine_id, engine.as_ref(), started)
    }

    /// Run several jobs concurrently. Results come back in job order.
    pub async fn dispatch_all(
        &self,
        jobs: &[DispatchJob],
        cancel: &CancellationToken,
    ) -> Vec<AlgorithmResult> {
        join_all(
            jobs.iter()
                .map(|job| self.dispatch(&job.engine_id, &job.input, cancel)),
        )
        .await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Force the requested id, fill in the version and elapsed time, and
/// re-apply the judgment so `is_ok` never contradicts the measurements.
fn normalize(
    mut result: AlgorithmResult,
    engine_id: &str,
    engine: &dyn AlgorithmEngine,
    started: Instant,
) -> AlgorithmResult {
    if result.engine_id != engine_id {
        warn!(
            "Engine '{}' answered as '{}'; reporting under the requested id",
            engine_id, result.engine_id
        );
        result.engine_id = engine_id.to_string();
    }
    if result.engine_version.is_empty() {
        result.engine_version = engine.engine_version().to_string();
    }
    if result.status == ExecutionStatus::Unknown {
        result.status = ExecutionStatus::Failed;
        result
            .error_message
            .get_or_insert_with(|| "engine returned no status".to_string());
    }
    if result.status != ExecutionStatus::Success && result.is_ok() {
        result.set_ok(false);
    } else {
        let ok = result.is_ok();
        result.set_ok(ok);
    }
    result.record_elapsed(started.elapsed());
    result
}
