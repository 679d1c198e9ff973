//! Adapter for the vendor vision-master pipeline.
//!
//! That pipeline runs outside this core. The adapter only marks a job as
//! belonging to it, so callers route it to the legacy flow explicitly.

use crate::algorithm::{AlgorithmEngine, AlgorithmInput, AlgorithmResult};
use crate::cancel::CancellationToken;
use crate::config::EngineIds;
use crate::error::Result;
use crate::plugins::{EngineFactory, EngineKinds, EngineManifest, FactoryContext};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct LegacyVmEngine {
    id: String,
    name: String,
    version: String,
}

impl LegacyVmEngine {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for LegacyVmEngine {
    fn default() -> Self {
        Self::new(EngineIds::VM, "Vision Master (legacy)", "1.0.0")
    }
}

#[async_trait]
impl AlgorithmEngine for LegacyVmEngine {
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
        true
    }

    async fn execute(&self, input: &AlgorithmInput, cancel: &CancellationToken) -> AlgorithmResult {
        if cancel.is_cancelled() {
            return AlgorithmResult::failed(&self.id, "cancelled").with_version(&self.version);
        }
        debug!(
            "Routing template '{}' image '{}' to the legacy pipeline",
            input.template_name, input.image_id
        );
        AlgorithmResult::legacy_pipeline(
            &self.id,
            "handled by the legacy vision pipeline outside the engine core",
        )
        .with_version(&self.version)
    }
}

pub struct LegacyVmFactory;

impl EngineFactory for LegacyVmFactory {
    fn kind(&self) -> &str {
        EngineKinds::LEGACY_VM
    }

    fn create(
        &self,
        entry: &EngineManifest,
        context: &FactoryContext,
    ) -> Result<Arc<dyn AlgorithmEngine>> {
        Ok(Arc::new(LegacyVmEngine::new(
            &entry.id,
            entry.display_name_or_id(),
            context.version_for(entry),
        )))
    }
}
