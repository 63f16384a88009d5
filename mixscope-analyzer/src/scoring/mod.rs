//! Reference scoring and suggestions
//!
//! [`score`] compares a [`TechnicalReport`](crate::models::report::TechnicalReport) against a
//! [`ReferenceProfile`] and returns a 0–100 score, a classification, per-metric detail and a
//! never-empty list of suggestions with a release-readiness summary. With a previous
//! iteration's scoring attached it also computes an adaptive progress score.

pub mod adaptive;
pub mod engine;
pub mod profile;
pub mod suggestions;

#[cfg(test)]
pub(crate) mod test_support;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::pipeline::spectral::Band;

pub use adaptive::{AdaptiveScore, BandProgress};
pub use engine::score;
pub use profile::{ProfileError, ReferenceProfile, Target};
pub use suggestions::{Severity, Suggestion, SuggestionSummary, SummaryRating, MUSICAL_CAP_DB};

/// Scored quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum MetricKey {
    IntegratedLoudness,
    TruePeak,
    DynamicRange,
    LoudnessRange,
    StereoCorrelation,
    Band(Band),
    /// Whole-mix informational entries
    Overall,
}

impl MetricKey {
    pub fn label(&self) -> String {
        match self {
            MetricKey::IntegratedLoudness => "Integrated loudness".to_string(),
            MetricKey::TruePeak => "True peak".to_string(),
            MetricKey::DynamicRange => "Dynamic range".to_string(),
            MetricKey::LoudnessRange => "Loudness range".to_string(),
            MetricKey::StereoCorrelation => "Stereo correlation".to_string(),
            MetricKey::Band(band) => format!("{} band", band.label()),
            MetricKey::Overall => "Overall".to_string(),
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricKey::IntegratedLoudness => "LUFS",
            MetricKey::TruePeak => "dBTP",
            MetricKey::LoudnessRange => "LU",
            MetricKey::StereoCorrelation | MetricKey::Overall => "",
            MetricKey::DynamicRange | MetricKey::Band(_) => "dB",
        }
    }

    /// Values in decibel-like units, subject to the musical cap
    pub fn is_decibel(&self) -> bool {
        !matches!(self, MetricKey::StereoCorrelation | MetricKey::Overall)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKey::IntegratedLoudness => f.write_str("integrated_lufs"),
            MetricKey::TruePeak => f.write_str("true_peak_dbtp"),
            MetricKey::DynamicRange => f.write_str("dynamic_range_db"),
            MetricKey::LoudnessRange => f.write_str("lra_lu"),
            MetricKey::StereoCorrelation => f.write_str("stereo_correlation"),
            MetricKey::Band(band) => write!(f, "band.{}", band.key()),
            MetricKey::Overall => f.write_str("overall"),
        }
    }
}

impl FromStr for MetricKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integrated_lufs" => Ok(MetricKey::IntegratedLoudness),
            "true_peak_dbtp" => Ok(MetricKey::TruePeak),
            "dynamic_range_db" => Ok(MetricKey::DynamicRange),
            "lra_lu" => Ok(MetricKey::LoudnessRange),
            "stereo_correlation" => Ok(MetricKey::StereoCorrelation),
            "overall" => Ok(MetricKey::Overall),
            other => other
                .strip_prefix("band.")
                .and_then(Band::from_key)
                .map(MetricKey::Band)
                .ok_or_else(|| format!("unknown metric key '{}'", other)),
        }
    }
}

impl From<MetricKey> for String {
    fn from(key: MetricKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for MetricKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Reference,
    StreamingReady,
    Good,
    NeedsCorrection,
    Unacceptable,
}

impl Classification {
    pub fn from_score(score_pct: f64) -> Self {
        match score_pct {
            s if s >= 90.0 => Classification::Reference,
            s if s >= 75.0 => Classification::StreamingReady,
            s if s >= 60.0 => Classification::Good,
            s if s >= 40.0 => Classification::NeedsCorrection,
            _ => Classification::Unacceptable,
        }
    }
}

/// One scored metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScore {
    pub metric: MetricKey,
    pub measured: f64,
    pub target: f64,
    pub tolerance: f64,
    /// `measured - target`; for true peak only the overshoot counts
    pub deviation: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub profile: String,
    /// `None` when nothing in the report could be scored
    pub score_pct: Option<f64>,
    pub classification: Option<Classification>,
    pub per_metric: Vec<MetricScore>,
    /// Always present; an evaluated clean mix carries informational entries
    pub suggestions: Vec<Suggestion>,
    pub summary: SuggestionSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveScore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_key_wire_format() {
        let key = MetricKey::Band(Band::LowMid);
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"band.low_mid\"");
        assert_eq!(
            serde_json::from_str::<MetricKey>("\"band.low_mid\"").unwrap(),
            key
        );
        assert!("band.ultra".parse::<MetricKey>().is_err());
    }

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(Classification::from_score(95.0), Classification::Reference);
        assert_eq!(Classification::from_score(90.0), Classification::Reference);
        assert_eq!(Classification::from_score(80.0), Classification::StreamingReady);
        assert_eq!(Classification::from_score(60.0), Classification::Good);
        assert_eq!(Classification::from_score(45.0), Classification::NeedsCorrection);
        assert_eq!(Classification::from_score(10.0), Classification::Unacceptable);
    }
}
