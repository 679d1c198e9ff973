//! Named numeric measurements with optional inclusive limits.

use super::input::AlgorithmInput;
use serde::{Deserialize, Serialize};

/// Inclusive limit pair. `f64::MIN` / `f64::MAX` mean "no limit on this side".
///
/// On the wire an absent side is `null`, so the sentinels never depend on
/// float round-tripping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "LimitsRecord", from = "LimitsRecord")]
pub struct MeasurementLimits {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Serialize, Deserialize)]
struct LimitsRecord {
    #[serde(default)]
    lower: Option<f64>,
    #[serde(default)]
    upper: Option<f64>,
}

impl From<MeasurementLimits> for LimitsRecord {
    fn from(limits: MeasurementLimits) -> Self {
        Self {
            lower: limits.has_lower().then_some(limits.lower),
            upper: limits.has_upper().then_some(limits.upper),
        }
    }
}

impl From<LimitsRecord> for MeasurementLimits {
    fn from(record: LimitsRecord) -> Self {
        Self {
            lower: record.lower.unwrap_or(f64::MIN),
            upper: record.upper.unwrap_or(f64::MAX),
        }
    }
}

impl MeasurementLimits {
    pub const NONE: MeasurementLimits = MeasurementLimits {
        lower: f64::MIN,
        upper: f64::MAX,
    };

    pub fn between(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn at_least(lower: f64) -> Self {
        Self {
            lower,
            upper: f64::MAX,
        }
    }

    pub fn at_most(upper: f64) -> Self {
        Self {
            lower: f64::MIN,
            upper,
        }
    }

    /// Read `<name>.Lower` / `<name>.Upper` from the input parameters.
    pub fn from_params(input: &AlgorithmInput, name: &str) -> Self {
        Self {
            lower: input
                .param_f64(&format!("{}.Lower", name))
                .unwrap_or(f64::MIN),
            upper: input
                .param_f64(&format!("{}.Upper", name))
                .unwrap_or(f64::MAX),
        }
    }

    pub fn has_lower(&self) -> bool {
        self.lower != f64::MIN
    }

    pub fn has_upper(&self) -> bool {
        self.upper != f64::MAX
    }

    pub fn is_configured(&self) -> bool {
        self.has_lower() || self.has_upper()
    }

    /// True when a configured side is violated.
    pub fn is_violated_by(&self, value: f64) -> bool {
        (self.has_lower() && value < self.lower) || (self.has_upper() && value > self.upper)
    }

    /// Inclusive containment; always true when no limit is configured.
    pub fn contains(&self, value: f64) -> bool {
        !self.is_violated_by(value)
    }
}

impl Default for MeasurementLimits {
    fn default() -> Self {
        Self::NONE
    }
}

/// Tags used only for downstream classification and export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeasurementTags {
    pub is_3d: bool,
    pub tool_index: Option<u32>,
}

/// One named measurement. `is_out_of_range` is fixed when it is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "MeasurementRecord")]
pub struct AlgorithmMeasurement {
    name: String,
    value: f64,
    text: String,
    is_valid: bool,
    limits: MeasurementLimits,
    is_out_of_range: bool,
    tags: MeasurementTags,
}

/// Wire shape; `is_out_of_range` from the peer is ignored and recomputed.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeasurementRecord {
    name: String,
    value: f64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default = "default_valid")]
    is_valid: bool,
    #[serde(default)]
    limits: MeasurementLimits,
    #[serde(default)]
    tags: MeasurementTags,
}

fn default_valid() -> bool {
    true
}

impl From<MeasurementRecord> for AlgorithmMeasurement {
    fn from(record: MeasurementRecord) -> Self {
        let mut m = AlgorithmMeasurement::new(record.name, record.value, record.limits)
            .with_tags(record.tags);
        if let Some(text) = record.text {
            m.text = text;
        }
        if !record.is_valid {
            m.is_valid = false;
        }
        m
    }
}

impl AlgorithmMeasurement {
    pub const DEFAULT_DECIMALS: usize = 3;

    pub fn new(name: impl Into<String>, value: f64, limits: MeasurementLimits) -> Self {
        Self::with_decimals(name, value, limits, Self::DEFAULT_DECIMALS)
    }

    pub fn with_decimals(
        name: impl Into<String>,
        value: f64,
        limits: MeasurementLimits,
        decimals: usize,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            text: format!("{:.*}", decimals, value),
            is_valid: value.is_finite(),
            limits,
            is_out_of_range: limits.is_violated_by(value),
            tags: MeasurementTags::default(),
        }
    }

    /// A measurement the engine could not compute. Never out of range.
    pub fn invalid(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: 0.0,
            text: "N/A".to_string(),
            is_valid: false,
            limits: MeasurementLimits::NONE,
            is_out_of_range: false,
            tags: MeasurementTags::default(),
        }
    }

    pub fn with_tags(mut self, tags: MeasurementTags) -> Self {
        self.tags = tags;
        self
    }

    pub fn three_d(mut self, tool_index: Option<u32>) -> Self {
        self.tags = MeasurementTags {
            is_3d: true,
            tool_index,
        };
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn limits(&self) -> MeasurementLimits {
        self.limits
    }

    pub fn is_out_of_range(&self) -> bool {
        self.is_out_of_range
    }

    pub fn tags(&self) -> MeasurementTags {
        self.tags
    }
}
