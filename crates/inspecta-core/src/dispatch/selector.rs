//! Resolve which engine a template should run on.

use crate::config::InspectaSettings;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct EngineSelector {
    default_engine: String,
    template_engines: HashMap<String, String>,
}

impl EngineSelector {
    pub fn new(default_engine: impl Into<String>) -> Self {
        Self {
            default_engine: default_engine.into(),
            template_engines: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &InspectaSettings) -> Self {
        Self {
            default_engine: settings.default_engine.clone(),
            template_engines: settings.template_engines.clone(),
        }
    }

    pub fn with_override(mut self, template: impl Into<String>, engine_id: impl Into<String>) -> Self {
        self.template_engines.insert(template.into(), engine_id.into());
        self
    }

    pub fn default_engine(&self) -> &str {
        &self.default_engine
    }

    /// The template override if one exists, else the default engine.
    ///
    /// Only picks an id; availability is the dispatcher's concern.
    pub fn resolve(&self, template_name: &str) -> &str {
        self.template_engines
            .get(template_name)
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(&self.default_engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_then_default() {
        let selector = EngineSelector::new("OpenCV")
            .with_override("Housing", "3D")
            .with_override("Blank", " ");
        assert_eq!(selector.resolve("Housing"), "3D");
        assert_eq!(selector.resolve("Lens"), "OpenCV");
        assert_eq!(selector.resolve("Blank"), "OpenCV");
    }

    #[test]
    fn test_from_settings() {
        let mut settings = InspectaSettings::default();
        settings.default_engine = "ONNX".to_string();
        settings
            .template_engines
            .insert("Housing".to_string(), "3D".to_string());

        let selector = EngineSelector::from_settings(&settings);
        assert_eq!(selector.default_engine(), "ONNX");
        assert_eq!(selector.resolve("Housing"), "3D");
        assert_eq!(selector.resolve("Other"), "ONNX");
    }
}
