//! Plugin manifest schema.
//!
//! Defines the structure of the JSON files placed in the plugins directory.
//! One manifest describes a plugin module and the engines it contributes.
//!
//! ```json
//! {
//!   "id": "vision-pack",
//!   "displayName": "Vision Pack",
//!   "version": "1.2.0",
//!   "engines": [
//!     { "id": "OpenCV", "kind": "gray-level", "settings": { "darkThreshold": 40 } }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Engine kinds the built-in factories construct.
pub struct EngineKinds;

impl EngineKinds {
    pub const LEGACY_VM: &'static str = "legacy-vm";
    pub const GRAY_LEVEL: &'static str = "gray-level";
    pub const ONNX: &'static str = "onnx";
    pub const THREE_D: &'static str = "three-d";
}

/// A plugin module: one manifest file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Module identifier, used in diagnostics.
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Engine entries contributed by this module.
    #[serde(default)]
    pub engines: Vec<EngineManifest>,
}

/// One engine entry inside a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineManifest {
    /// Engine id registered in the registry (`VM`, `OpenCV`, `ONNX`, `3D`, ...).
    pub id: String,
    /// Factory key.
    pub kind: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Falls back to the module version.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Engine-specific knobs interpreted by the factory.
    #[serde(default)]
    pub settings: Map<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

impl EngineManifest {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            display_name: None,
            version: None,
            description: String::new(),
            enabled: true,
            settings: Map::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn display_name_or_id(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    pub fn setting_f64(&self, key: &str) -> Option<f64> {
        self.settings.get(key).and_then(Value::as_f64)
    }

    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(Value::as_u64)
    }

    pub fn setting_bool(&self, key: &str) -> Option<bool> {
        self.settings.get(key).and_then(Value::as_bool)
    }

    pub fn setting_strings(&self, key: &str) -> Option<Vec<String>> {
        self.settings.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_defaults() {
        let manifest: PluginManifest = serde_json::from_str(
            r#"{
                "id": "pack",
                "engines": [ { "id": "VM", "kind": "legacy-vm" } ]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.version, "1.0.0");
        let engine = &manifest.engines[0];
        assert!(engine.enabled);
        assert!(engine.version.is_none());
        assert_eq!(engine.display_name_or_id(), "VM");
    }

    #[test]
    fn test_setting_accessors() {
        let engine: EngineManifest = serde_json::from_str(
            r#"{
                "id": "ONNX",
                "kind": "onnx",
                "settings": {
                    "modelPath": "model.onnx",
                    "minConfidence": 0.8,
                    "inputSize": 224,
                    "labels": ["OK", "Scratch", 3]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(engine.setting_str("modelPath"), Some("model.onnx"));
        assert_eq!(engine.setting_f64("minConfidence"), Some(0.8));
        assert_eq!(engine.setting_u64("inputSize"), Some(224));
        assert_eq!(
            engine.setting_strings("labels").unwrap(),
            vec!["OK".to_string(), "Scratch".to_string()]
        );
        assert!(engine.setting_str("missing").is_none());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let manifest: PluginManifest = serde_json::from_str(
            r#"{ "id": "pack", "futureField": { "x": 1 }, "engines": [] }"#,
        )
        .unwrap();
        assert!(manifest.engines.is_empty());
    }
}
