//! Inspection input handed to every engine.

use super::params::ParamMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Well-known image keys.
pub struct ImageKeys;

impl ImageKeys {
    pub const GRAY: &'static str = "Gray";
    pub const HEIGHT: &'static str = "Height";
    pub const COLOR: &'static str = "Color";
}

/// Value bag describing one sample to inspect.
///
/// Every engine call receives its own instance. Absent parameters and images
/// are a valid "not provided" state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlgorithmInput {
    pub template_name: String,
    pub lot_id: String,
    pub image_id: String,
    pub sample_type: String,
    pub coating_type: String,
    pub parameters: ParamMap,
    pub images: ParamMap,
}

impl AlgorithmInput {
    pub fn new(template_name: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
            ..Default::default()
        }
    }

    pub fn with_ids(mut self, lot_id: impl Into<String>, image_id: impl Into<String>) -> Self {
        self.lot_id = lot_id.into();
        self.image_id = image_id.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key, value);
        self
    }

    pub fn with_image(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.images.insert(key, path);
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key)
    }

    /// Parse a parameter as a float. Unparseable values count as absent.
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.param(key).and_then(|v| v.trim().parse().ok())
    }

    /// Parse a parameter as a boolean (`true/false/1/0/yes/no`).
    pub fn param_bool(&self, key: &str) -> Option<bool> {
        match self.param(key)?.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        }
    }

    /// Path of a named image, ignoring blank entries.
    pub fn image_path(&self, key: &str) -> Option<PathBuf> {
        self.images
            .get(key)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let input = AlgorithmInput::new("Lid-A")
            .with_param("DarkThreshold", " 40 ")
            .with_param("SaveImages", "Yes")
            .with_param("Broken", "abc");

        assert_eq!(input.param_f64("darkthreshold"), Some(40.0));
        assert_eq!(input.param_bool("saveimages"), Some(true));
        assert_eq!(input.param_f64("Broken"), None);
        assert_eq!(input.param_f64("Absent"), None);
    }

    #[test]
    fn test_blank_image_path_is_absent() {
        let input = AlgorithmInput::new("Lid-A")
            .with_image(ImageKeys::GRAY, "  ")
            .with_image(ImageKeys::HEIGHT, "h.png");

        assert!(input.image_path("gray").is_none());
        assert_eq!(input.image_path("height"), Some(PathBuf::from("h.png")));
    }

    #[test]
    fn test_deserialize_with_missing_fields() {
        let input: AlgorithmInput =
            serde_json::from_str(r#"{ "templateName": "T1", "images": { "gray": "g.png" } }"#)
                .unwrap();
        assert_eq!(input.template_name, "T1");
        assert!(input.lot_id.is_empty());
        assert!(input.image_path(ImageKeys::GRAY).is_some());
    }
}
