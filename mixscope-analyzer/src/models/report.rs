//! Technical report: the externally visible analysis artifact
//!
//! Every numeric leaf is `Option<f64>`; `None` serializes as `null` and means the value was
//! not finite (see [`Sanitizer`](crate::pipeline::sanitizer::Sanitizer)). The field layout is
//! versioned by `schema_version`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::dynamics::DcSeverity;
use crate::pipeline::spectral::{Band, SpectralStatus, UniformityRating};
use crate::pipeline::true_peak::InterpolationOrder;
use crate::pipeline::EngineKind;
use crate::scoring::ScoringResult;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalReport {
    pub schema_version: u32,
    pub file: FileInfo,
    pub loudness: LoudnessReport,
    pub true_peak: TruePeakReport,
    pub spectral: SpectralReport,
    pub tempo: TempoReport,
    pub dynamics: Option<DynamicsReport>,
    pub stereo: Option<StereoReport>,
    pub diagnostics: Diagnostics,
}

impl TechnicalReport {
    pub fn band_level(&self, band: Band) -> Option<f64> {
        self.spectral
            .bands
            .iter()
            .find(|b| b.band == band)
            .and_then(|b| b.energy_db)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub input_ref: String,
    pub display_name: Option<String>,
    pub decoder: String,
    pub duration_seconds: Option<f64>,
    pub sample_rate: u32,
    pub source_channels: usize,
    pub samples_per_channel: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoudnessReport {
    pub integrated_lufs: Option<f64>,
    pub short_term_lufs: Option<f64>,
    pub short_term_max_lufs: Option<f64>,
    pub momentary_max_lufs: Option<f64>,
    pub lra_lu: Option<f64>,
    /// Gain that would bring the mix to the -14 LUFS streaming reference
    pub loudness_offset_db: Option<f64>,
    pub gated_blocks: usize,
    pub total_blocks: usize,
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruePeakReport {
    pub max_dbtp: Option<f64>,
    pub max_linear: Option<f64>,
    pub sample_peak_dbfs: Option<f64>,
    /// `[left, right]`
    pub per_channel_dbtp: Vec<Option<f64>>,
    pub clipped_samples: usize,
    pub exceeds_ceiling: bool,
    pub interpolation: InterpolationOrder,
    pub oversampling: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralReport {
    pub status: SpectralStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub frames_analyzed: usize,
    pub bands: Vec<BandReport>,
    pub descriptors: Option<DescriptorReport>,
    pub dominant_frequencies: Vec<PeakReport>,
    #[serde(default)]
    pub sub_bands: Vec<SubBandReport>,
    #[serde(default)]
    pub uniformity: Option<UniformityReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandReport {
    pub band: Band,
    pub energy_db: Option<f64>,
    pub percentage: Option<f64>,
}

/// Narrower slice of a [`BandReport`] band, e.g. `bass_low`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubBandReport {
    pub id: String,
    pub band: Band,
    pub low_hz: f64,
    pub high_hz: f64,
    pub energy_db: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniformityReport {
    pub std_dev_db: Option<f64>,
    pub range_db: Option<f64>,
    pub mean_deviation_db: Option<f64>,
    pub rating: UniformityRating,
    pub densest_band: Band,
    pub weakest_band: Band,
    /// Treble minus bass density
    pub tilt_db: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorReport {
    pub centroid_hz: Option<f64>,
    pub rolloff_hz: Option<f64>,
    pub spread_hz: Option<f64>,
    pub flatness: Option<f64>,
    pub crest: Option<f64>,
    pub skewness: Option<f64>,
    pub kurtosis: Option<f64>,
    pub zero_crossing_rate: Option<f64>,
    pub flux: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakReport {
    pub frequency_hz: Option<f64>,
    pub magnitude_db: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoReport {
    pub bpm: Option<f64>,
    pub confidence: Option<f64>,
    pub onsets_detected: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicsReport {
    pub dynamic_range_db: Option<f64>,
    pub crest_factor_db: Option<f64>,
    pub rms_dbfs: Option<f64>,
    pub peak_dbfs: Option<f64>,
    /// Max true peak minus integrated loudness
    pub peak_to_loudness_ratio: Option<f64>,
    #[serde(default)]
    pub dc_offset: Option<DcOffsetReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcOffsetReport {
    pub left: Option<f64>,
    pub right: Option<f64>,
    pub max_abs: Option<f64>,
    pub imbalance: Option<f64>,
    pub temporal_variation: Option<f64>,
    pub severity: DcSeverity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoReport {
    pub correlation: Option<f64>,
    pub width: Option<f64>,
    pub balance_db: Option<f64>,
    pub mono_compatible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineOutcome {
    Ok,
    Timeout,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineDiagnostic {
    pub outcome: EngineOutcome,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub engines: BTreeMap<EngineKind, EngineDiagnostic>,
    /// Field paths whose values were replaced or truncated
    pub sanitized_fields: Vec<String>,
    pub fft_frames: usize,
    pub loudness_blocks: usize,
    pub frames_truncated: bool,
}

/// Persisted `result` payload: the report, plus scoring when a profile was attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(flatten)]
    pub report: TechnicalReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring: Option<ScoringResult>,
}
