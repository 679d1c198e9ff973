//! Combine per-engine results into one inspection verdict.

use crate::algorithm::{AlgorithmMeasurement, AlgorithmResult, ExecutionStatus};
use serde::{Deserialize, Serialize};

/// A measurement together with the engine that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMeasurement {
    pub engine_id: String,
    pub measurement: AlgorithmMeasurement,
}

/// An engine that did not produce a judgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineIssue {
    pub engine_id: String,
    pub status: ExecutionStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionReport {
    /// True only when every result succeeded and judged OK.
    pub is_ok: bool,
    /// Defect of the first NG result, in result order.
    pub defect_type: Option<String>,
    pub measurements: Vec<EngineMeasurement>,
    pub issues: Vec<EngineIssue>,
    pub engine_count: usize,
}

impl InspectionReport {
    /// An empty result list is not a pass.
    pub fn aggregate<'a>(results: impl IntoIterator<Item = &'a AlgorithmResult>) -> Self {
        let mut report = InspectionReport {
            is_ok: true,
            ..Default::default()
        };

        for result in results {
            report.engine_count += 1;
            report
                .measurements
                .extend(result.measurements().iter().map(|m| EngineMeasurement {
                    engine_id: result.engine_id.clone(),
                    measurement: m.clone(),
                }));

            if result.status != ExecutionStatus::Success {
                report.is_ok = false;
                report.issues.push(EngineIssue {
                    engine_id: result.engine_id.clone(),
                    status: result.status,
                    message: result.error_message.clone(),
                });
                continue;
            }
            if !result.is_ok() {
                report.is_ok = false;
                if report.defect_type.is_none() && !result.defect_type.is_empty() {
                    report.defect_type = Some(result.defect_type.clone());
                }
            }
        }

        if report.engine_count == 0 {
            report.is_ok = false;
        }
        report
    }

    pub fn out_of_range(&self) -> impl Iterator<Item = &EngineMeasurement> {
        self.measurements
            .iter()
            .filter(|m| m.measurement.is_out_of_range())
    }
}
