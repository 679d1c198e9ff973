//! The vendor 3-D SDK seam.
//!
//! The vendor SDK is a blocking, thread-affine black box that only lives in
//! the host process. [`ThreeDSdk`] is the surface the host service drives;
//! [`SimulatedSdk`] stands in for it when no vendor SDK is linked.

use crate::error::{InspectaError, Result};
use crate::ipc::protocol::{
    ThreeDConfig, ThreeDExecuteRequest, ThreeDExecuteResult, ThreeDMeasurement,
    ThreeDSaveAfterJudgementRequest,
};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Blocking 3-D SDK operations. Called from `spawn_blocking`.
pub trait ThreeDSdk: Send + Sync + 'static {
    fn version(&self) -> String;

    /// One-time SDK startup (license check, device enumeration).
    fn initialize(&self) -> Result<()>;

    /// Load the project/template the following executions run against.
    fn configure(&self, config: &ThreeDConfig) -> Result<()>;

    /// Run the 3-D tools against a height image and its gray companion.
    fn execute(&self, request: &ThreeDExecuteRequest) -> Result<ThreeDExecuteResult>;

    /// Persist the images of the last execution according to the judgment.
    fn save_images(&self, request: &ThreeDSaveAfterJudgementRequest) -> Result<()>;
}

/// Parameter keys understood by [`SimulatedSdk`].
pub struct SimulationKeys;

impl SimulationKeys {
    /// `Simulate.<Name>` = value adds or overrides a measurement.
    pub const MEASUREMENT_PREFIX: &'static str = "Simulate.";
    /// Milliseconds to block inside `execute`.
    pub const DELAY_MS: &'static str = "Simulate.DelayMs";
    /// Non-empty text makes `execute` fail with that message.
    pub const FAIL: &'static str = "Simulate.Fail";
}

#[derive(Debug, Default)]
struct SimulatedState {
    config: Option<ThreeDConfig>,
    last_images: Option<(String, String)>,
}

/// Deterministic SDK stand-in.
///
/// Produces a fixed set of measurements, optionally adjusted per request via
/// `Simulate.*` parameters. Limits come from `<Name>.Lower` / `<Name>.Upper`
/// request parameters, mirroring how real templates carry tolerances.
#[derive(Debug)]
pub struct SimulatedSdk {
    measurements: Vec<(String, f64)>,
    fail_initialize: bool,
    state: Mutex<SimulatedState>,
}

impl Default for SimulatedSdk {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSdk {
    pub const VERSION: &'static str = "simulated-1.0";

    pub fn new() -> Self {
        Self {
            measurements: Vec::new(),
            fail_initialize: false,
            state: Mutex::new(SimulatedState::default()),
        }
    }

    /// Add a measurement every execution reports.
    pub fn with_measurement(mut self, name: impl Into<String>, value: f64) -> Self {
        self.measurements.push((name.into(), value));
        self
    }

    /// Make `initialize` fail, as a missing license would.
    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn limit(request: &ThreeDExecuteRequest, name: &str, side: &str) -> Option<f64> {
        request
            .parameters
            .get(&format!("{}.{}", name, side))
            .and_then(|v| v.trim().parse::<f64>().ok())
    }

    /// Measurement name of a `Simulate.<Name>` key, ignoring the prefix's case.
    fn simulated_name(key: &str) -> Option<&str> {
        let prefix = SimulationKeys::MEASUREMENT_PREFIX;
        key.get(..prefix.len())
            .filter(|head| head.eq_ignore_ascii_case(prefix))
            .and_then(|_| key.get(prefix.len()..))
            .filter(|name| !name.is_empty())
    }

    fn require_file(path: &str, what: &str) -> Result<()> {
        if path.trim().is_empty() {
            return Err(InspectaError::Validation {
                field: what.to_string(),
                message: "no image path given".to_string(),
            });
        }
        if !Path::new(path).is_file() {
            return Err(InspectaError::Validation {
                field: what.to_string(),
                message: format!("image not found: {}", path),
            });
        }
        Ok(())
    }
}

impl ThreeDSdk for SimulatedSdk {
    fn version(&self) -> String {
        Self::VERSION.to_string()
    }

    fn initialize(&self) -> Result<()> {
        if self.fail_initialize {
            return Err(InspectaError::Other(
                "simulated SDK initialization failure".to_string(),
            ));
        }
        info!("Simulated 3-D SDK initialized");
        Ok(())
    }

    fn configure(&self, config: &ThreeDConfig) -> Result<()> {
        debug!("Simulated 3-D SDK configured for '{}'", config.template_name);
        self.lock().config = Some(config.clone());
        Ok(())
    }

    fn execute(&self, request: &ThreeDExecuteRequest) -> Result<ThreeDExecuteResult> {
        let started = Instant::now();
        Self::require_file(&request.height_image_path, "heightImagePath")?;
        Self::require_file(&request.gray_image_path, "grayImagePath")?;

        if let Some(delay) = request
            .parameters
            .get(SimulationKeys::DELAY_MS)
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            std::thread::sleep(Duration::from_millis(delay));
        }

        if let Some(message) = request
            .parameters
            .get(SimulationKeys::FAIL)
            .filter(|m| !m.is_empty())
        {
            return Err(InspectaError::Other(message.to_string()));
        }

        let mut values: Vec<(String, f64)> = self.measurements.clone();
        for (key, value) in request.parameters.iter() {
            let Some(name) = Self::simulated_name(key) else {
                continue;
            };
            if key.eq_ignore_ascii_case(SimulationKeys::DELAY_MS)
                || key.eq_ignore_ascii_case(SimulationKeys::FAIL)
            {
                continue;
            }
            let Ok(value) = value.trim().parse::<f64>() else {
                continue;
            };
            match values
                .iter_mut()
                .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            {
                Some(slot) => slot.1 = value,
                None => values.push((name.to_string(), value)),
            }
        }

        let mut defect_type = String::new();
        let measurements: Vec<ThreeDMeasurement> = values
            .into_iter()
            .enumerate()
            .map(|(index, (name, value))| {
                let lower_limit = Self::limit(request, &name, "Lower");
                let upper_limit = Self::limit(request, &name, "Upper");
                let out_of_range = lower_limit.is_some_and(|l| value < l)
                    || upper_limit.is_some_and(|u| value > u);
                if out_of_range && defect_type.is_empty() {
                    defect_type = name.clone();
                }
                ThreeDMeasurement {
                    name,
                    value,
                    is_valid: value.is_finite(),
                    lower_limit,
                    upper_limit,
                    tool_index: u32::try_from(index).ok(),
                }
            })
            .collect();

        self.lock().last_images = Some((
            request.height_image_path.clone(),
            request.gray_image_path.clone(),
        ));

        Ok(ThreeDExecuteResult {
            is_judge_all_ok: defect_type.is_empty() && measurements.iter().all(|m| m.is_valid),
            defect_type,
            measurements,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    fn save_images(&self, request: &ThreeDSaveAfterJudgementRequest) -> Result<()> {
        let wanted = if request.is_ok {
            request.save_ok_images
        } else {
            request.save_ng_images
        };
        if !wanted {
            return Ok(());
        }

        let state = self.lock();
        let Some((height, gray)) = state.last_images.clone() else {
            return Err(InspectaError::Validation {
                field: "saveAfterJudgement".to_string(),
                message: "no execution to save images for".to_string(),
            });
        };
        let dir = request
            .output_dir
            .clone()
            .or_else(|| state.config.as_ref().and_then(|c| c.image_save_dir.clone()));
        drop(state);

        let Some(dir) = dir else {
            return Err(InspectaError::Config {
                message: "no image save directory configured".to_string(),
            });
        };

        let verdict = if request.is_ok { "OK" } else { "NG" };
        let target = Path::new(&dir).join(verdict);
        std::fs::create_dir_all(&target).map_err(|e| InspectaError::io_with_path(e, &target))?;
        for source in [height, gray] {
            let source = Path::new(&source);
            let Some(file_name) = source.file_name() else {
                continue;
            };
            let dest = target.join(format!(
                "{}_{}_{}",
                request.lot_id,
                request.image_id,
                file_name.to_string_lossy()
            ));
            std::fs::copy(source, &dest).map_err(|e| InspectaError::io_with_path(e, source))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn images(dir: &TempDir) -> (String, String) {
        let height = dir.path().join("height.tif");
        let gray = dir.path().join("gray.png");
        std::fs::write(&height, b"h").unwrap();
        std::fs::write(&gray, b"g").unwrap();
        (
            height.to_string_lossy().into_owned(),
            gray.to_string_lossy().into_owned(),
        )
    }

    fn request(dir: &TempDir) -> ThreeDExecuteRequest {
        let (height, gray) = images(dir);
        ThreeDExecuteRequest {
            height_image_path: height,
            gray_image_path: gray,
            template_name: "T1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_execute_reports_configured_measurements() {
        let dir = TempDir::new().unwrap();
        let sdk = SimulatedSdk::new().with_measurement("Gap", 0.12);

        let mut req = request(&dir);
        req.parameters.insert("Gap.Lower", "0.05");
        req.parameters.insert("Gap.Upper", "0.2");
        let result = sdk.execute(&req).unwrap();

        assert!(result.is_judge_all_ok);
        assert_eq!(result.measurements.len(), 1);
        assert_eq!(result.measurements[0].name, "Gap");
        assert_eq!(result.measurements[0].upper_limit, Some(0.2));
    }

    #[test]
    fn test_parameter_override_drives_ng() {
        let dir = TempDir::new().unwrap();
        let sdk = SimulatedSdk::new().with_measurement("Gap", 0.12);

        let mut req = request(&dir);
        req.parameters.insert("Simulate.Gap", "0.5");
        req.parameters.insert("Gap.Upper", "0.2");
        let result = sdk.execute(&req).unwrap();

        assert!(!result.is_judge_all_ok);
        assert_eq!(result.defect_type, "Gap");
        assert_eq!(result.measurements[0].value, 0.5);
    }

    #[test]
    fn test_parameter_keys_ignore_case() {
        let dir = TempDir::new().unwrap();
        let sdk = SimulatedSdk::new().with_measurement("Gap", 0.35);

        let mut req = request(&dir);
        req.parameters.insert("gap.upper", "0.2");
        req.parameters.insert("SIMULATE.Flatness", "0.01");
        let result = sdk.execute(&req).unwrap();

        assert!(!result.is_judge_all_ok);
        assert_eq!(result.defect_type, "Gap");
        assert_eq!(result.measurements[0].upper_limit, Some(0.2));
        assert_eq!(result.measurements[1].name, "Flatness");

        let mut req = request(&dir);
        req.parameters.insert("simulate.gap", "0.1");
        let result = sdk.execute(&req).unwrap();
        assert_eq!(result.measurements.len(), 1);
        assert_eq!(result.measurements[0].value, 0.1);
    }

    #[test]
    fn test_non_finite_value_is_invalid() {
        let dir = TempDir::new().unwrap();
        let sdk = SimulatedSdk::new();

        let mut req = request(&dir);
        req.parameters.insert("Simulate.Flatness", "NaN");
        let result = sdk.execute(&req).unwrap();

        assert!(!result.measurements[0].is_valid);
        assert!(!result.is_judge_all_ok);
    }

    #[test]
    fn test_missing_image_fails() {
        let sdk = SimulatedSdk::new();
        let req = ThreeDExecuteRequest {
            height_image_path: "/nonexistent/height.tif".to_string(),
            gray_image_path: "/nonexistent/gray.png".to_string(),
            ..Default::default()
        };
        let err = sdk.execute(&req).unwrap_err();
        assert!(err.to_string().contains("image not found"));
    }

    #[test]
    fn test_save_images_copies_into_verdict_dir() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let sdk = SimulatedSdk::new();
        sdk.execute(&request(&dir)).unwrap();

        sdk.save_images(&ThreeDSaveAfterJudgementRequest {
            is_ok: false,
            save_ng_images: true,
            lot_id: "L1".to_string(),
            image_id: "7".to_string(),
            output_dir: Some(out.path().to_string_lossy().into_owned()),
            ..Default::default()
        })
        .unwrap();

        assert!(out.path().join("NG").join("L1_7_height.tif").exists());
        assert!(out.path().join("NG").join("L1_7_gray.png").exists());
    }

    #[test]
    fn test_save_skipped_when_verdict_not_wanted() {
        let sdk = SimulatedSdk::new();
        // No execution yet, but OK images are not wanted so nothing is touched.
        sdk.save_images(&ThreeDSaveAfterJudgementRequest {
            is_ok: true,
            save_ok_images: false,
            ..Default::default()
        })
        .unwrap();
    }
}
