//! Engine adapter for the out-of-process 3-D host.
//!
//! The engine is a thin translator: [`AlgorithmInput`] becomes an
//! `ExecuteWithLocalImages` request, the host's measurements become
//! [`AlgorithmMeasurement`]s tagged as 3-D. Availability follows the
//! host connection, so a stopped host makes the engine report
//! `NotAvailable` without attempting a call.

use crate::algorithm::{
    AlgorithmEngine, AlgorithmInput, AlgorithmMeasurement, AlgorithmResult, DebugKeys, ImageKeys,
    MeasurementLimits,
};
use crate::cancel::CancellationToken;
use crate::config::{EngineIds, IpcConfig};
use crate::error::Result;
use crate::ipc::{
    ThreeDConfig, ThreeDExecuteRequest, ThreeDExecuteResult, ThreeDIpcRequest, ThreeDIpcResponse,
    ThreeDMeasurement, ThreeDSaveAfterJudgementRequest,
};
use crate::plugins::{EngineFactory, EngineKinds, EngineManifest, FactoryContext};
use crate::three_d::ThreeDHost;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct ThreeDEngine {
    id: String,
    name: String,
    version: String,
    host: Arc<ThreeDHost>,
    timeout: Duration,
}

impl ThreeDEngine {
    pub fn new(id: impl Into<String>, version: impl Into<String>, host: Arc<ThreeDHost>) -> Self {
        Self {
            id: id.into(),
            name: "3-D host".to_string(),
            version: version.into(),
            host,
            timeout: IpcConfig::DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &Arc<ThreeDHost> {
        &self.host
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn failed(&self, message: impl Into<String>) -> AlgorithmResult {
        AlgorithmResult::failed(&self.id, message).with_version(&self.version)
    }

    /// Apply a template configuration on the host.
    pub async fn configure(&self, config: ThreeDConfig) -> Result<ThreeDIpcResponse> {
        self.host
            .call(
                ThreeDIpcRequest::configure(config),
                self.timeout,
                &CancellationToken::new(),
            )
            .await
    }

    /// Ask the host to persist the judged images.
    pub async fn save_after_judgement(
        &self,
        request: ThreeDSaveAfterJudgementRequest,
    ) -> Result<ThreeDIpcResponse> {
        self.host
            .call(
                ThreeDIpcRequest::save_after_judgement(request),
                self.timeout,
                &CancellationToken::new(),
            )
            .await
    }

    fn build_request(
        input: &AlgorithmInput,
        height: String,
        gray: String,
    ) -> ThreeDExecuteRequest {
        ThreeDExecuteRequest {
            height_image_path: height,
            gray_image_path: gray,
            template_name: input.template_name.clone(),
            lot_id: input.lot_id.clone(),
            image_id: input.image_id.clone(),
            parameters: input.parameters.clone(),
        }
    }

    fn to_result(&self, result: ThreeDExecuteResult) -> AlgorithmResult {
        let mut out = AlgorithmResult::success(&self.id, &self.version);
        out.extend_measurements(result.measurements.into_iter().map(convert_measurement));
        out.set_ok(result.is_judge_all_ok);
        out.defect_type = result.defect_type;
        if out.defect_type.is_empty() && !out.is_ok() {
            let first = out
                .out_of_range_measurements()
                .next()
                .or_else(|| out.measurements().iter().find(|m| !m.is_valid()))
                .map(|m| m.name().to_string());
            if let Some(name) = first {
                out.defect_type = name;
            }
        }
        out.with_debug("hostElapsedMs", result.elapsed_ms.to_string())
    }
}

fn convert_measurement(m: ThreeDMeasurement) -> AlgorithmMeasurement {
    if !m.is_usable() {
        return AlgorithmMeasurement::invalid(m.name).three_d(m.tool_index);
    }
    let limits = MeasurementLimits {
        lower: m.lower_limit.unwrap_or(MeasurementLimits::NONE.lower),
        upper: m.upper_limit.unwrap_or(MeasurementLimits::NONE.upper),
    };
    AlgorithmMeasurement::new(m.name, m.value, limits).three_d(m.tool_index)
}

#[async_trait]
impl AlgorithmEngine for ThreeDEngine {
    fn engine_id(&self) -> &str {
        &self.id
    }

    fn engine_name(&self) -> &str {
        &self.name
    }

    fn engine_version(&self) -> &str {
        &self.version
    }

    fn is_available(&self) -> bool {
        self.host.is_available()
    }

    async fn execute(&self, input: &AlgorithmInput, cancel: &CancellationToken) -> AlgorithmResult {
        let started = Instant::now();
        if !self.host.is_available() {
            return AlgorithmResult::not_available(&self.id, "3-D host is not running")
                .with_version(&self.version);
        }
        if cancel.is_cancelled() {
            return self.failed("cancelled");
        }

        let (Some(height), Some(gray)) = (
            input.image_path(ImageKeys::HEIGHT),
            input.image_path(ImageKeys::GRAY),
        ) else {
            return self.failed("3-D inspection needs both Height and Gray images");
        };
        let request = ThreeDIpcRequest::execute_with_local_images(Self::build_request(
            input,
            height.to_string_lossy().into_owned(),
            gray.to_string_lossy().into_owned(),
        ));
        let request_id = request.request_id;

        let response = match self.host.call(request, self.timeout, cancel).await {
            Ok(response) => response,
            Err(e) => return self.failed(e.to_string()),
        };

        let mut result = match response.result {
            Some(host_result) if response.success => self.to_result(host_result),
            _ => {
                let kind = response
                    .error_kind
                    .map(|k| k.as_str())
                    .unwrap_or("Unknown");
                if response.is_channel_fault() {
                    warn!("3-D execution {} lost the host: {}", request_id, response.error_text());
                } else {
                    debug!("3-D execution {} failed ({}): {}", request_id, kind, response.error_text());
                }
                self.failed(response.error_text())
                    .with_debug(DebugKeys::FAILURE_KIND, kind)
            }
        };
        result
            .debug_info
            .insert(DebugKeys::REQUEST_ID.to_string(), request_id.to_string());
        result.record_elapsed(started.elapsed());
        result
    }
}

/// Builds [`ThreeDEngine`]s bound to the shared host connection.
pub struct ThreeDFactory {
    host: Arc<ThreeDHost>,
    default_timeout: Duration,
}

impl ThreeDFactory {
    pub fn new(host: Arc<ThreeDHost>, default_timeout: Duration) -> Self {
        Self {
            host,
            default_timeout,
        }
    }
}

impl EngineFactory for ThreeDFactory {
    fn kind(&self) -> &str {
        EngineKinds::THREE_D
    }

    fn create(
        &self,
        entry: &EngineManifest,
        context: &FactoryContext,
    ) -> Result<Arc<dyn AlgorithmEngine>> {
        let timeout = entry
            .setting_u64("timeoutMs")
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        Ok(Arc::new(
            ThreeDEngine::new(&entry.id, context.version_for(entry), self.host.clone())
                .with_name(entry.display_name_or_id())
                .with_timeout(timeout),
        ))
    }
}

impl std::fmt::Debug for ThreeDEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreeDEngine")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Default id used when the engine is registered in code.
pub fn default_three_d_engine(host: Arc<ThreeDHost>) -> ThreeDEngine {
    ThreeDEngine::new(EngineIds::THREE_D, "1.0.0", host)
}
