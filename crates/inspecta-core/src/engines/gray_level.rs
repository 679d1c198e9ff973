//! In-process gray-level 2-D engine.
//!
//! Decodes the configured image and reports two measurements:
//! - `MeanGray`: mean 8-bit luminance
//! - `DarkRatio`: fraction of pixels darker than the threshold
//!
//! Limits come from `<Measurement>.Lower` / `<Measurement>.Upper` input
//! parameters.

use crate::algorithm::{
    AlgorithmEngine, AlgorithmInput, AlgorithmMeasurement, AlgorithmResult, ImageKeys,
    MeasurementLimits,
};
use crate::cancel::CancellationToken;
use crate::config::EngineIds;
use crate::error::{InspectaError, Result};
use crate::plugins::{EngineFactory, EngineKinds, EngineManifest, FactoryContext};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Per-input override of the dark threshold.
const DARK_THRESHOLD_PARAM: &str = "DarkThreshold";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrayStats {
    pub mean: f64,
    pub dark_ratio: f64,
    pub pixels: u64,
}

/// Decode an image as 8-bit luma and compute its statistics. Blocking.
pub fn analyze_gray(path: &Path, dark_threshold: u8) -> Result<GrayStats> {
    let image = image::open(path).map_err(|e| InspectaError::Validation {
        field: "image".to_string(),
        message: format!("cannot decode {}: {}", path.display(), e),
    })?;
    let luma = image.to_luma8();

    let mut sum: u64 = 0;
    let mut dark: u64 = 0;
    for pixel in luma.pixels() {
        let v = pixel.0[0];
        sum += u64::from(v);
        if v < dark_threshold {
            dark += 1;
        }
    }

    let pixels = u64::from(luma.width()) * u64::from(luma.height());
    if pixels == 0 {
        return Err(InspectaError::Validation {
            field: "image".to_string(),
            message: format!("{} has no pixels", path.display()),
        });
    }

    Ok(GrayStats {
        mean: sum as f64 / pixels as f64,
        dark_ratio: dark as f64 / pixels as f64,
        pixels,
    })
}

pub struct GrayLevelEngine {
    id: String,
    name: String,
    version: String,
    image_key: String,
    dark_threshold: u8,
    enabled: bool,
}

impl GrayLevelEngine {
    pub const DEFAULT_DARK_THRESHOLD: u8 = 64;
    pub const MEAN_GRAY: &'static str = "MeanGray";
    pub const DARK_RATIO: &'static str = "DarkRatio";

    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: "Gray level".to_string(),
            version: version.into(),
            image_key: ImageKeys::GRAY.to_string(),
            dark_threshold: Self::DEFAULT_DARK_THRESHOLD,
            enabled: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_image_key(mut self, key: impl Into<String>) -> Self {
        self.image_key = key.into();
        self
    }

    pub fn with_dark_threshold(mut self, threshold: u8) -> Self {
        self.dark_threshold = threshold;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn failed(&self, message: impl Into<String>) -> AlgorithmResult {
        AlgorithmResult::failed(&self.id, message).with_version(&self.version)
    }

    fn threshold_for(&self, input: &AlgorithmInput) -> u8 {
        input
            .param_f64(DARK_THRESHOLD_PARAM)
            .filter(|t| (0.0..=255.0).contains(t))
            .map(|t| t as u8)
            .unwrap_or(self.dark_threshold)
    }
}

impl Default for GrayLevelEngine {
    fn default() -> Self {
        Self::new(EngineIds::OPENCV, "1.0.0")
    }
}

#[async_trait]
impl AlgorithmEngine for GrayLevelEngine {
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
        self.enabled
    }

    async fn execute(&self, input: &AlgorithmInput, cancel: &CancellationToken) -> AlgorithmResult {
        let started = Instant::now();
        if !self.enabled {
            return AlgorithmResult::not_available(&self.id, "engine is disabled")
                .with_version(&self.version);
        }
        if cancel.is_cancelled() {
            return self.failed("cancelled");
        }

        let Some(path) = input.image_path(&self.image_key) else {
            return self.failed(format!("input has no '{}' image", self.image_key));
        };
        let threshold = self.threshold_for(input);

        let decode_path = path.clone();
        let stats =
            match tokio::task::spawn_blocking(move || analyze_gray(&decode_path, threshold)).await {
                Ok(Ok(stats)) => stats,
                Ok(Err(e)) => return self.failed(e.to_string()),
                Err(e) => return self.failed(format!("image analysis aborted: {}", e)),
            };

        if cancel.is_cancelled() {
            return self.failed("cancelled");
        }
        debug!(
            "Gray analysis of {}: mean {:.2}, dark ratio {:.4}",
            path.display(),
            stats.mean,
            stats.dark_ratio
        );

        let mut result = AlgorithmResult::success(&self.id, &self.version);
        result.push_measurement(AlgorithmMeasurement::with_decimals(
            Self::MEAN_GRAY,
            stats.mean,
            MeasurementLimits::from_params(input, Self::MEAN_GRAY),
            2,
        ));
        result.push_measurement(AlgorithmMeasurement::with_decimals(
            Self::DARK_RATIO,
            stats.dark_ratio,
            MeasurementLimits::from_params(input, Self::DARK_RATIO),
            4,
        ));
        let defect = result
            .out_of_range_measurements()
            .next()
            .map(|m| m.name().to_string());
        if let Some(defect) = defect {
            result.defect_type = defect;
        }
        result.description = format!("{} pixels analysed", stats.pixels);
        result.record_elapsed(started.elapsed());
        result
    }
}

pub struct GrayLevelFactory;

impl EngineFactory for GrayLevelFactory {
    fn kind(&self) -> &str {
        EngineKinds::GRAY_LEVEL
    }

    fn create(
        &self,
        entry: &EngineManifest,
        context: &FactoryContext,
    ) -> Result<Arc<dyn AlgorithmEngine>> {
        let mut engine = GrayLevelEngine::new(&entry.id, context.version_for(entry))
            .with_name(entry.display_name_or_id())
            .with_enabled(entry.enabled);

        if let Some(key) = entry.setting_str("imageKey") {
            engine = engine.with_image_key(key);
        }
        if let Some(threshold) = entry.setting_u64("darkThreshold") {
            let threshold = u8::try_from(threshold).map_err(|_| InspectaError::Validation {
                field: "darkThreshold".to_string(),
                message: format!("{} is outside 0..=255", threshold),
            })?;
            engine = engine.with_dark_threshold(threshold);
        }
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::ExecutionStatus;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Left half black, right half white.
    fn write_half_dark(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("gray.png");
        let image = image::GrayImage::from_fn(10, 10, |x, _| {
            if x < 5 {
                image::Luma([0u8])
            } else {
                image::Luma([255u8])
            }
        });
        image.save(&path).unwrap();
        path
    }

    #[test]
    fn test_analyze_gray() {
        let dir = TempDir::new().unwrap();
        let stats = analyze_gray(&write_half_dark(&dir), 64).unwrap();
        assert_eq!(stats.pixels, 100);
        assert!((stats.mean - 127.5).abs() < 1e-9);
        assert!((stats.dark_ratio - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_execute_within_limits_is_ok() {
        let dir = TempDir::new().unwrap();
        let path = write_half_dark(&dir);
        let input = AlgorithmInput::new("T1")
            .with_image("gray", path.to_string_lossy())
            .with_param("DarkRatio.Upper", "0.6");

        let result = GrayLevelEngine::default()
            .execute(&input, &CancellationToken::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(result.is_ok());
        assert_eq!(result.measurements().len(), 2);
        assert_eq!(result.measurement("DarkRatio").unwrap().text(), "0.5000");
        assert!(result.debug_info.contains_key("elapsedMs"));
    }

    #[tokio::test]
    async fn test_execute_out_of_range_is_ng() {
        let dir = TempDir::new().unwrap();
        let path = write_half_dark(&dir);
        let input = AlgorithmInput::new("T1")
            .with_image("Gray", path.to_string_lossy())
            .with_param("DarkRatio.Upper", "0.1");

        let result = GrayLevelEngine::default()
            .execute(&input, &CancellationToken::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(!result.is_ok());
        assert_eq!(result.defect_type, "DarkRatio");
    }

    #[tokio::test]
    async fn test_missing_or_undecodable_image_fails() {
        let engine = GrayLevelEngine::default();
        let result = engine
            .execute(&AlgorithmInput::new("T1"), &CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error_message.unwrap().contains("Gray"));

        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("bogus.png");
        std::fs::write(&bogus, b"not a png").unwrap();
        let input = AlgorithmInput::new("T1").with_image("Gray", bogus.to_string_lossy());
        let result = engine.execute(&input, &CancellationToken::new()).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_before_decode() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let input = AlgorithmInput::new("T1").with_image("Gray", "/tmp/unused.png");

        let result = GrayLevelEngine::default().execute(&input, &cancel).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_factory_rejects_bad_threshold() {
        let context = FactoryContext {
            manifest_dir: PathBuf::from("."),
            module_id: "m".to_string(),
            module_version: "1".to_string(),
        };
        let entry = EngineManifest::new("OpenCV", EngineKinds::GRAY_LEVEL)
            .with_setting("darkThreshold", 300);
        assert!(GrayLevelFactory.create(&entry, &context).is_err());

        let entry = EngineManifest::new("OpenCV", EngineKinds::GRAY_LEVEL)
            .with_setting("darkThreshold", 40)
            .with_setting("imageKey", "Color");
        let engine = GrayLevelFactory.create(&entry, &context).unwrap();
        assert_eq!(engine.engine_id(), "OpenCV");
    }
}
