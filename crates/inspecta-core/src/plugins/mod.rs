//! Plugin discovery for algorithm engines.
//!
//! A plugin module is a JSON manifest in the plugins directory. Each manifest
//! lists the engines it contributes:
//! - Engine id, display name and version
//! - The factory `kind` that constructs it
//! - Engine-specific settings (model paths, thresholds, timeouts)
//!
//! Loading is two-phase: [`PluginLoader::discover`] constructs what it can
//! and reports the rest, then the caller registers the result.

mod factory;
mod loader;
mod manifest;

pub use factory::{EngineFactory, EngineFactorySet, FactoryContext};
pub use loader::{PluginDiscovery, PluginLoadError, PluginLoader};
pub use manifest::{EngineKinds, EngineManifest, PluginManifest};
