//! Plugin manifest loader.
//!
//! Scans the plugins directory for manifests, constructs every enabled engine
//! they list, and reports what failed alongside what loaded. Registration is
//! a separate step so the caller decides what to do with a partial load.

use super::factory::{EngineFactorySet, FactoryContext};
use super::manifest::PluginManifest;
use crate::algorithm::PluginDescriptor;
use crate::config::PluginConfig;
use crate::error::{InspectaError, Result};
use crate::registry::{EnginePlugin, EngineRegistry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One module or engine entry that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginLoadError {
    pub path: PathBuf,
    /// Set when the failure is specific to one engine entry.
    pub engine_id: Option<String>,
    pub message: String,
}

impl std::fmt::Display for PluginLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.engine_id {
            Some(id) => write!(f, "{} [{}]: {}", self.path.display(), id, self.message),
            None => write!(f, "{}: {}", self.path.display(), self.message),
        }
    }
}

/// Outcome of one directory scan.
#[derive(Debug, Default)]
pub struct PluginDiscovery {
    pub plugins: Vec<EnginePlugin>,
    pub errors: Vec<PluginLoadError>,
}

impl PluginDiscovery {
    /// Human-readable error strings, one per failure.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.plugins.iter().map(|p| p.descriptor().clone()).collect()
    }

    /// Register every discovered plugin. Returns how many were registered.
    pub fn register_into(self, registry: &EngineRegistry) -> usize {
        registry.register_range(self.plugins)
    }
}

/// Discovers engine plugins from manifest files.
#[derive(Debug, Clone)]
pub struct PluginLoader {
    factories: EngineFactorySet,
}

impl PluginLoader {
    pub fn new(factories: EngineFactorySet) -> Self {
        Self { factories }
    }

    pub fn factories(&self) -> &EngineFactorySet {
        &self.factories
    }

    /// Scan `plugins_dir`.
    ///
    /// A missing directory yields no plugins and no errors. Every other
    /// problem is recorded per manifest or per engine entry and the scan
    /// continues.
    pub fn discover(&self, plugins_dir: impl AsRef<Path>) -> PluginDiscovery {
        let plugins_dir = plugins_dir.as_ref();
        let mut discovery = PluginDiscovery::default();

        if !plugins_dir.exists() {
            debug!("Plugins directory {} does not exist", plugins_dir.display());
            return discovery;
        }
        if !plugins_dir.is_dir() {
            discovery.errors.push(PluginLoadError {
                path: plugins_dir.to_path_buf(),
                engine_id: None,
                message: "plugins path is not a directory".to_string(),
            });
            return discovery;
        }

        // Engine id -> manifest that first contributed it.
        let mut seen: HashMap<String, PathBuf> = HashMap::new();

        for path in self.manifest_paths(plugins_dir, &mut discovery.errors) {
            let manifest = match Self::load_manifest_file(&path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("Failed to load plugin manifest from {}: {}", path.display(), e);
                    discovery.errors.push(PluginLoadError {
                        path: path.clone(),
                        engine_id: None,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            self.construct_engines(&manifest, &path, &mut seen, &mut discovery);
        }

        info!(
            "Discovered {} engine plugin(s) in {} ({} error(s))",
            discovery.plugins.len(),
            plugins_dir.display(),
            discovery.errors.len()
        );
        discovery
    }

    /// [`discover`](Self::discover) on the blocking pool.
    pub async fn discover_async(&self, plugins_dir: PathBuf) -> PluginDiscovery {
        let loader = self.clone();
        let dir = plugins_dir.clone();
        match tokio::task::spawn_blocking(move || loader.discover(dir)).await {
            Ok(discovery) => discovery,
            Err(e) => PluginDiscovery {
                plugins: Vec::new(),
                errors: vec![PluginLoadError {
                    path: plugins_dir,
                    engine_id: None,
                    message: format!("plugin scan aborted: {}", e),
                }],
            },
        }
    }

    /// `*.json` directly in the directory, plus `<subdir>/plugin.json`.
    /// Sorted by path so the load order is stable.
    fn manifest_paths(&self, plugins_dir: &Path, errors: &mut Vec<PluginLoadError>) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let walker = WalkDir::new(plugins_dir)
            .min_depth(1)
            .max_depth(PluginConfig::MAX_SCAN_DEPTH)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    errors.push(PluginLoadError {
                        path: e.path().map(Path::to_path_buf).unwrap_or_else(|| plugins_dir.to_path_buf()),
                        engine_id: None,
                        message: format!("cannot scan: {}", e),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let is_manifest = match entry.depth() {
                1 => path
                    .extension()
                    .is_some_and(|ext| ext == PluginConfig::MANIFEST_EXTENSION),
                _ => entry.file_name() == PluginConfig::NESTED_MANIFEST_NAME,
            };
            if is_manifest {
                paths.push(path.to_path_buf());
            }
        }
        paths
    }

    /// Read and validate one manifest file.
    fn load_manifest_file(path: &Path) -> Result<PluginManifest> {
        let content =
            std::fs::read_to_string(path).map_err(|e| InspectaError::io_with_path(e, path))?;

        let manifest: PluginManifest =
            serde_json::from_str(&content).map_err(|e| InspectaError::PluginLoad {
                path: path.to_path_buf(),
                message: format!("invalid manifest JSON: {}", e),
            })?;

        if manifest.id.trim().is_empty() {
            return Err(InspectaError::PluginLoad {
                path: path.to_path_buf(),
                message: "manifest has an empty id".to_string(),
            });
        }
        if manifest.engines.is_empty() {
            return Err(InspectaError::PluginLoad {
                path: path.to_path_buf(),
                message: format!("module '{}' declares no engines", manifest.id),
            });
        }

        Ok(manifest)
    }

    fn construct_engines(
        &self,
        manifest: &PluginManifest,
        path: &Path,
        seen: &mut HashMap<String, PathBuf>,
        discovery: &mut PluginDiscovery,
    ) {
        let context = FactoryContext::for_manifest(manifest, path);

        for entry in &manifest.engines {
            let entry_error = |message: String| PluginLoadError {
                path: path.to_path_buf(),
                engine_id: Some(entry.id.clone()),
                message,
            };

            if entry.id.trim().is_empty() {
                discovery
                    .errors
                    .push(entry_error("engine entry has an empty id".to_string()));
                continue;
            }
            if !entry.enabled {
                debug!("Engine '{}' in {} is disabled", entry.id, path.display());
                continue;
            }
            if let Some(first) = seen.get(&entry.id) {
                discovery.errors.push(entry_error(format!(
                    "duplicate engine id; already provided by {}",
                    first.display()
                )));
                continue;
            }

            let engine = match self.factories.create(entry, &context) {
                Ok(engine) => engine,
                Err(e) => {
                    warn!("Failed to construct engine '{}': {}", entry.id, e);
                    discovery.errors.push(entry_error(e.to_string()));
                    continue;
                }
            };

            let descriptor = PluginDescriptor {
                id: entry.id.clone(),
                display_name: entry.display_name_or_id().to_string(),
                version: context.version_for(entry),
                is_available: engine.is_available(),
                description: entry.description.clone(),
                kind: entry.kind.clone(),
                source: Some(path.to_path_buf()),
            };

            info!(
                "Loaded engine plugin: {} ({}) from module '{}'",
                descriptor.display_name, descriptor.id, manifest.id
            );
            seen.insert(entry.id.clone(), path.to_path_buf());
            discovery.plugins.push(EnginePlugin::new(descriptor, engine));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::three_d::ThreeDHost;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn loader() -> PluginLoader {
        PluginLoader::new(EngineFactorySet::builtin(
            Arc::new(ThreeDHost::new()),
            Duration::from_secs(1),
        ))
    }

    fn create_manifest(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(format!("{}.json", name)), content).unwrap();
    }

    const VALID: &str = r#"{
        "id": "vision-pack",
        "displayName": "Vision Pack",
        "version": "1.2.0",
        "engines": [
            { "id": "OpenCV", "kind": "gray-level", "displayName": "Gray level" },
            { "id": "VM", "kind": "legacy-vm" }
        ]
    }"#;

    #[test]
    fn test_missing_directory_yields_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let discovery = loader().discover(temp_dir.path().join("plugins"));

        assert!(discovery.plugins.is_empty());
        assert!(discovery.errors.is_empty());
    }

    #[test]
    fn test_empty_directory_yields_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let discovery = loader().discover(temp_dir.path());

        assert!(discovery.plugins.is_empty());
        assert!(discovery.errors.is_empty());
    }

    #[test]
    fn test_load_manifest() {
        let temp_dir = TempDir::new().unwrap();
        create_manifest(temp_dir.path(), "vision-pack", VALID);

        let discovery = loader().discover(temp_dir.path());
        assert!(discovery.errors.is_empty(), "{:?}", discovery.error_messages());

        let descriptors = discovery.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].id, "OpenCV");
        assert_eq!(descriptors[0].display_name, "Gray level");
        assert_eq!(descriptors[0].version, "1.2.0");
        assert_eq!(descriptors[0].kind, "gray-level");
        assert_eq!(descriptors[1].id, "VM");
    }

    #[test]
    fn test_valid_and_corrupt_module() {
        let temp_dir = TempDir::new().unwrap();
        create_manifest(
            temp_dir.path(),
            "good",
            r#"{ "id": "good", "engines": [ { "id": "OpenCV", "kind": "gray-level" } ] }"#,
        );
        create_manifest(temp_dir.path(), "corrupt", "{ not valid json }");

        let discovery = loader().discover(temp_dir.path());
        assert_eq!(discovery.plugins.len(), 1);
        assert_eq!(discovery.plugins[0].id(), "OpenCV");
        assert!(!discovery.errors.is_empty());
        assert!(discovery.error_messages().iter().all(|m| !m.is_empty()));
        assert!(discovery.error_messages()[0].contains("corrupt.json"));
    }

    #[test]
    fn test_directory_with_only_unusable_modules() {
        let temp_dir = TempDir::new().unwrap();
        create_manifest(temp_dir.path(), "bad", "[]");
        create_manifest(temp_dir.path(), "no-id", r#"{ "id": "", "engines": [] }"#);

        let discovery = loader().discover(temp_dir.path());
        assert!(discovery.plugins.is_empty());
        assert_eq!(discovery.errors.len(), 2);
    }

    #[test]
    fn test_engine_entry_errors_do_not_block_siblings() {
        let temp_dir = TempDir::new().unwrap();
        create_manifest(
            temp_dir.path(),
            "mixed",
            r#"{
                "id": "mixed",
                "engines": [
                    { "id": "Halcon", "kind": "halcon" },
                    { "id": "VM", "kind": "legacy-vm" },
                    { "id": "Off", "kind": "legacy-vm", "enabled": false }
                ]
            }"#,
        );

        let discovery = loader().discover(temp_dir.path());
        assert_eq!(discovery.plugins.len(), 1);
        assert_eq!(discovery.errors.len(), 1);
        assert_eq!(discovery.errors[0].engine_id.as_deref(), Some("Halcon"));
        assert!(discovery.errors[0].message.contains("halcon"));
    }

    #[test]
    fn test_duplicate_engine_id_reported() {
        let temp_dir = TempDir::new().unwrap();
        create_manifest(
            temp_dir.path(),
            "a",
            r#"{ "id": "a", "engines": [ { "id": "VM", "kind": "legacy-vm" } ] }"#,
        );
        create_manifest(
            temp_dir.path(),
            "b",
            r#"{ "id": "b", "engines": [ { "id": "VM", "kind": "legacy-vm" } ] }"#,
        );

        let discovery = loader().discover(temp_dir.path());
        assert_eq!(discovery.plugins.len(), 1);
        assert_eq!(discovery.errors.len(), 1);
        assert!(discovery.errors[0].path.ends_with("b.json"));
    }

    #[test]
    fn test_nested_plugin_json_and_non_manifests() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("onnx-pack");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("plugin.json"),
            r#"{ "id": "nested", "engines": [ { "id": "VM", "kind": "legacy-vm" } ] }"#,
        )
        .unwrap();
        std::fs::write(nested.join("labels.json"), "[]").unwrap();
        std::fs::write(temp_dir.path().join("README.txt"), "not a manifest").unwrap();

        let discovery = loader().discover(temp_dir.path());
        assert!(discovery.errors.is_empty(), "{:?}", discovery.error_messages());
        assert_eq!(discovery.plugins.len(), 1);
        assert!(discovery.plugins[0]
            .descriptor()
            .source
            .as_ref()
            .unwrap()
            .ends_with("onnx-pack/plugin.json"));
    }

    #[tokio::test]
    async fn test_discover_async_and_register() {
        let temp_dir = TempDir::new().unwrap();
        create_manifest(temp_dir.path(), "vision-pack", VALID);

        let discovery = loader().discover_async(temp_dir.path().to_path_buf()).await;
        let registry = EngineRegistry::new();
        assert_eq!(discovery.register_into(&registry), 2);
        assert!(registry.get("OpenCV").is_some());
        assert!(registry.get("VM").is_some());
    }
}
