//! Report builders for scoring tests

use std::collections::BTreeMap;

use crate::models::report::{
    BandReport, Diagnostics, DynamicsReport, FileInfo, LoudnessReport, SpectralReport,
    StereoReport, TechnicalReport, TempoReport, TruePeakReport, REPORT_SCHEMA_VERSION,
};
use crate::pipeline::spectral::{Band, SpectralStatus};
use crate::pipeline::true_peak::InterpolationOrder;

use super::profile::ReferenceProfile;

/// A report whose every measurement sits exactly on the profile's targets
pub fn report_matching(profile: &ReferenceProfile) -> TechnicalReport {
    let target = |t: Option<&super::Target>, fallback: f64| Some(t.map_or(fallback, |t| t.target));

    TechnicalReport {
        schema_version: REPORT_SCHEMA_VERSION,
        file: FileInfo {
            input_ref: "mix.wav".to_string(),
            display_name: None,
            decoder: "test".to_string(),
            duration_seconds: Some(180.0),
            sample_rate: 48_000,
            source_channels: 2,
            samples_per_channel: 180 * 48_000,
        },
        loudness: LoudnessReport {
            integrated_lufs: target(profile.lufs.as_ref(), -14.0),
            short_term_lufs: target(profile.lufs.as_ref(), -14.0),
            short_term_max_lufs: Some(-10.0),
            momentary_max_lufs: Some(-9.0),
            lra_lu: target(profile.lra.as_ref(), 6.0),
            loudness_offset_db: Some(0.0),
            gated_blocks: 1000,
            total_blocks: 1000,
            partial: false,
        },
        true_peak: TruePeakReport {
            max_dbtp: target(profile.true_peak.as_ref(), -1.0),
            max_linear: Some(0.89),
            sample_peak_dbfs: Some(-1.2),
            per_channel_dbtp: vec![Some(-1.0), Some(-1.1)],
            clipped_samples: 0,
            exceeds_ceiling: false,
            interpolation: InterpolationOrder::Sinc,
            oversampling: 4,
        },
        spectral: SpectralReport {
            status: SpectralStatus::Calculated,
            reason: None,
            frames_analyzed: 9000,
            bands: Band::ALL
                .into_iter()
                .map(|band| BandReport {
                    band,
                    energy_db: profile.bands.get(&band).map(|t| t.target),
                    percentage: Some(100.0 / Band::ALL.len() as f64),
                })
                .collect(),
            descriptors: None,
            dominant_frequencies: Vec::new(),
            sub_bands: Vec::new(),
            uniformity: None,
        },
        tempo: TempoReport {
            bpm: Some(128.0),
            confidence: Some(0.8),
            onsets_detected: 400,
            reason: None,
        },
        dynamics: Some(DynamicsReport {
            dynamic_range_db: target(profile.dynamic_range.as_ref(), 5.0),
            crest_factor_db: Some(9.0),
            rms_dbfs: Some(-12.0),
            peak_dbfs: Some(-1.2),
            peak_to_loudness_ratio: Some(13.0),
            dc_offset: None,
        }),
        stereo: Some(StereoReport {
            correlation: target(profile.stereo_correlation.as_ref(), 0.5),
            width: Some(0.6),
            balance_db: Some(0.0),
            mono_compatible: true,
        }),
        diagnostics: Diagnostics {
            engines: BTreeMap::new(),
            ..Default::default()
        },
    }
}
