//! Outcome of one engine invocation.

use super::measurement::AlgorithmMeasurement;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How an engine invocation ended. Independent of the pass/fail judgment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[default]
    Unknown,
    Success,
    Failed,
    NotAvailable,
    Skipped,
    /// The job belongs to the legacy vision pipeline outside this core.
    LegacyPipeline,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Unknown => "Unknown",
            ExecutionStatus::Success => "Success",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::NotAvailable => "NotAvailable",
            ExecutionStatus::Skipped => "Skipped",
            ExecutionStatus::LegacyPipeline => "LegacyPipeline",
        };
        f.write_str(s)
    }
}

/// Debug-info keys written by the core.
pub struct DebugKeys;

impl DebugKeys {
    pub const ELAPSED_MS: &'static str = "elapsedMs";
    pub const FAILURE_KIND: &'static str = "failureKind";
    pub const REQUEST_ID: &'static str = "requestId";
}

/// Result of a single engine execution.
///
/// `is_ok` and the measurement list are private so that "ok implies no
/// out-of-range measurement" holds for every instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "ResultRecord")]
pub struct AlgorithmResult {
    pub engine_id: String,
    pub engine_version: String,
    pub status: ExecutionStatus,
    is_ok: bool,
    pub defect_type: String,
    pub description: String,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    measurements: Vec<AlgorithmMeasurement>,
    pub debug_info: BTreeMap<String, String>,
}

/// Wire shape; the judgment is re-checked against the measurements on read.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultRecord {
    engine_id: String,
    #[serde(default)]
    engine_version: String,
    #[serde(default)]
    status: ExecutionStatus,
    #[serde(default)]
    is_ok: bool,
    #[serde(default)]
    defect_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    measurements: Vec<AlgorithmMeasurement>,
    #[serde(default)]
    debug_info: BTreeMap<String, String>,
}

impl From<ResultRecord> for AlgorithmResult {
    fn from(record: ResultRecord) -> Self {
        let mut result = Self {
            engine_id: record.engine_id,
            engine_version: record.engine_version,
            status: record.status,
            is_ok: record.is_ok,
            defect_type: record.defect_type,
            description: record.description,
            error_message: record.error_message,
            timestamp: record.timestamp,
            measurements: record.measurements,
            debug_info: record.debug_info,
        };
        result.set_ok(record.is_ok);
        result
    }
}

impl AlgorithmResult {
    fn with_status(engine_id: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            engine_id: engine_id.into(),
            engine_version: String::new(),
            status,
            is_ok: false,
            defect_type: String::new(),
            description: String::new(),
            error_message: None,
            timestamp: Utc::now(),
            measurements: Vec::new(),
            debug_info: BTreeMap::new(),
        }
    }

    /// A successful run judged OK until a measurement or `set_ok` says otherwise.
    pub fn success(engine_id: impl Into<String>, engine_version: impl Into<String>) -> Self {
        let mut result = Self::with_status(engine_id, ExecutionStatus::Success);
        result.engine_version = engine_version.into();
        result.is_ok = true;
        result
    }

    pub fn failed(engine_id: impl Into<String>, error: impl Into<String>) -> Self {
        let mut result = Self::with_status(engine_id, ExecutionStatus::Failed);
        result.error_message = Some(error.into());
        result
    }

    pub fn not_available(engine_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::with_status(engine_id, ExecutionStatus::NotAvailable);
        result.error_message = Some(reason.into());
        result
    }

    pub fn skipped(engine_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::with_status(engine_id, ExecutionStatus::Skipped);
        result.description = reason.into();
        result
    }

    pub fn legacy_pipeline(engine_id: impl Into<String>, description: impl Into<String>) -> Self {
        let mut result = Self::with_status(engine_id, ExecutionStatus::LegacyPipeline);
        result.description = description.into();
        result
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.engine_version = version.into();
        self
    }

    pub fn with_debug(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.debug_info.insert(key.into(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.is_ok
    }

    /// Set the overall judgment. Any out-of-range measurement forces `false`.
    pub fn set_ok(&mut self, ok: bool) {
        self.is_ok = ok && !self.has_out_of_range();
    }

    /// Append a measurement; an out-of-range one turns the judgment to NG.
    pub fn push_measurement(&mut self, measurement: AlgorithmMeasurement) {
        if measurement.is_out_of_range() {
            self.is_ok = false;
        }
        self.measurements.push(measurement);
    }

    pub fn extend_measurements(&mut self, measurements: impl IntoIterator<Item = AlgorithmMeasurement>) {
        for m in measurements {
            self.push_measurement(m);
        }
    }

    pub fn measurements(&self) -> &[AlgorithmMeasurement] {
        &self.measurements
    }

    pub fn measurement(&self, name: &str) -> Option<&AlgorithmMeasurement> {
        self.measurements.iter().find(|m| m.name() == name)
    }

    pub fn out_of_range_measurements(&self) -> impl Iterator<Item = &AlgorithmMeasurement> {
        self.measurements.iter().filter(|m| m.is_out_of_range())
    }

    pub fn has_out_of_range(&self) -> bool {
        self.measurements.iter().any(|m| m.is_out_of_range())
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn record_elapsed(&mut self, elapsed: Duration) {
        self.debug_info.insert(
            DebugKeys::ELAPSED_MS.to_string(),
            elapsed.as_millis().to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::MeasurementLimits;

    #[test]
    fn test_success_starts_ok() {
        let result = AlgorithmResult::success("OpenCV", "1.0");
        assert!(result.is_ok());
        assert_eq!(result.status, ExecutionStatus::Success);
    }

    #[test]
    fn test_out_of_range_measurement_forces_ng() {
        let mut result = AlgorithmResult::success("OpenCV", "1.0");
        result.push_measurement(AlgorithmMeasurement::new(
            "Gap",
            0.5,
            MeasurementLimits::between(0.0, 0.2),
        ));
        assert!(!result.is_ok());
        assert_eq!(result.status, ExecutionStatus::Success);

        result.set_ok(true);
        assert!(!result.is_ok());
        assert_eq!(result.out_of_range_measurements().count(), 1);
    }

    #[test]
    fn test_success_can_be_ng_without_measurements() {
        let mut result = AlgorithmResult::success("ONNX", "2.1");
        result.set_ok(false);
        assert!(!result.is_ok());
        assert!(result.is_success());
    }

    #[test]
    fn test_failure_constructors() {
        let failed = AlgorithmResult::failed("3D", "bad image");
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(!failed.is_ok());
        assert_eq!(failed.error_message.as_deref(), Some("bad image"));

        let na = AlgorithmResult::not_available("Onnx", "not registered");
        assert_eq!(na.status, ExecutionStatus::NotAvailable);
        assert!(na.measurements().is_empty());
    }

    #[test]
    fn test_deserialize_cannot_smuggle_ok_past_out_of_range() {
        let json = serde_json::json!({
            "engineId": "3D",
            "status": "Success",
            "isOk": true,
            "measurements": [
                { "name": "Gap", "value": 0.5, "limits": { "lower": 0.0, "upper": 0.2 } }
            ]
        });

        let result: AlgorithmResult = serde_json::from_value(json).unwrap();
        assert!(!result.is_ok());
        assert_eq!(result.measurements().len(), 1);
    }
}
