//! The engine capability interface and its descriptor.

use super::input::AlgorithmInput;
use super::result::AlgorithmResult;
use crate::cancel::CancellationToken;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Uniform execution contract over in-process and out-of-process engines.
///
/// `execute` reports ordinary failures through the returned result
/// (`Failed` / `NotAvailable` with an error message) and never panics for
/// them. `is_available` must be cheap, side-effect-free, and non-blocking:
/// it is polled before every dispatch.
#[async_trait::async_trait]
pub trait AlgorithmEngine: Send + Sync {
    fn engine_id(&self) -> &str;

    fn engine_name(&self) -> &str;

    fn engine_version(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Run the engine on one input. Cancellation is observed before each
    /// expensive step and aborts without partial side effects.
    async fn execute(&self, input: &AlgorithmInput, cancel: &CancellationToken) -> AlgorithmResult;
}

/// Identity record for a discoverable engine.
///
/// Created at load time and never mutated; reloading the same id replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub id: String,
    pub display_name: String,
    pub version: String,
    /// Availability observed when the descriptor was created.
    pub is_available: bool,
    pub description: String,
    /// Factory kind that constructed the engine.
    pub kind: String,
    /// Manifest the engine came from; `None` for engines registered in code.
    pub source: Option<PathBuf>,
}

/// The same record viewed from the engine side.
pub type AlgorithmEngineDescriptor = PluginDescriptor;

impl PluginDescriptor {
    /// Describe an engine constructed in code.
    pub fn for_engine(engine: &dyn AlgorithmEngine, kind: impl Into<String>) -> Self {
        Self {
            id: engine.engine_id().to_string(),
            display_name: engine.engine_name().to_string(),
            version: engine.engine_version().to_string(),
            is_available: engine.is_available(),
            description: String::new(),
            kind: kind.into(),
            source: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }
}
