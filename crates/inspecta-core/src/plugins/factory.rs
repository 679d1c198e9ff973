//! Engine construction by manifest `kind`.
//!
//! Rust has no runtime type discovery, so the loader constructs engines
//! through an explicit table of factories keyed by kind.

use super::manifest::{EngineManifest, PluginManifest};
use crate::algorithm::AlgorithmEngine;
use crate::engines::{GrayLevelFactory, LegacyVmFactory, OnnxFactory, ThreeDFactory};
use crate::error::{InspectaError, Result};
use crate::three_d::ThreeDHost;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// What a factory gets to see besides the engine entry.
#[derive(Debug, Clone)]
pub struct FactoryContext {
    /// Directory of the manifest; relative paths in settings resolve here.
    pub manifest_dir: PathBuf,
    pub module_id: String,
    pub module_version: String,
}

impl FactoryContext {
    pub fn for_manifest(manifest: &PluginManifest, manifest_path: &Path) -> Self {
        Self {
            manifest_dir: manifest_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            module_id: manifest.id.clone(),
            module_version: manifest.version.clone(),
        }
    }

    /// Resolve a settings path against the manifest directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.manifest_dir.join(path)
        }
    }

    /// The engine version, falling back to the module version.
    pub fn version_for(&self, entry: &EngineManifest) -> String {
        entry
            .version
            .clone()
            .unwrap_or_else(|| self.module_version.clone())
    }
}

/// Builds one kind of engine from a manifest entry.
pub trait EngineFactory: Send + Sync {
    fn kind(&self) -> &str;

    fn create(
        &self,
        entry: &EngineManifest,
        context: &FactoryContext,
    ) -> Result<Arc<dyn AlgorithmEngine>>;
}

/// Factory table keyed by kind.
#[derive(Default, Clone)]
pub struct EngineFactorySet {
    factories: HashMap<String, Arc<dyn EngineFactory>>,
}

impl EngineFactorySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factories for every engine kind this crate ships.
    pub fn builtin(three_d_host: Arc<ThreeDHost>, ipc_timeout: Duration) -> Self {
        let mut set = Self::new();
        set.register(Arc::new(LegacyVmFactory));
        set.register(Arc::new(GrayLevelFactory));
        set.register(Arc::new(OnnxFactory::default()));
        set.register(Arc::new(ThreeDFactory::new(three_d_host, ipc_timeout)));
        set
    }

    /// Add or replace the factory for its kind.
    pub fn register(&mut self, factory: Arc<dyn EngineFactory>) {
        self.factories.insert(factory.kind().to_string(), factory);
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn EngineFactory>> {
        self.factories.get(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Construct the engine for one entry.
    pub fn create(
        &self,
        entry: &EngineManifest,
        context: &FactoryContext,
    ) -> Result<Arc<dyn AlgorithmEngine>> {
        let factory = self
            .get(&entry.kind)
            .ok_or_else(|| InspectaError::UnknownEngineKind {
                kind: entry.kind.clone(),
            })?;
        factory.create(entry, context)
    }
}

impl std::fmt::Debug for EngineFactorySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineFactorySet")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::EngineKinds;

    fn context() -> FactoryContext {
        FactoryContext {
            manifest_dir: PathBuf::from("/plugins/pack"),
            module_id: "pack".to_string(),
            module_version: "2.0.0".to_string(),
        }
    }

    #[test]
    fn test_builtin_kinds() {
        let set = EngineFactorySet::builtin(Arc::new(ThreeDHost::new()), Duration::from_secs(1));
        assert_eq!(
            set.kinds(),
            vec![
                EngineKinds::GRAY_LEVEL,
                EngineKinds::LEGACY_VM,
                EngineKinds::ONNX,
                EngineKinds::THREE_D
            ]
        );
    }

    #[test]
    fn test_unknown_kind_is_error() {
        let set = EngineFactorySet::new();
        let err = set
            .create(&EngineManifest::new("X", "halcon"), &context())
            .err()
            .unwrap();
        assert!(matches!(err, InspectaError::UnknownEngineKind { kind } if kind == "halcon"));
    }

    #[test]
    fn test_context_resolves_relative_paths_and_versions() {
        let ctx = context();
        assert_eq!(ctx.resolve("model.onnx"), PathBuf::from("/plugins/pack/model.onnx"));
        assert_eq!(ctx.resolve("/abs/model.onnx"), PathBuf::from("/abs/model.onnx"));

        let mut entry = EngineManifest::new("VM", EngineKinds::LEGACY_VM);
        assert_eq!(ctx.version_for(&entry), "2.0.0");
        entry.version = Some("3.1".to_string());
        assert_eq!(ctx.version_for(&entry), "3.1");
    }
}
