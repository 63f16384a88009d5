//! Aggregator: engine records → [`TechnicalReport`]
//!
//! Records are looked up by [`EngineKind`], so the report does not depend on which engine
//! finished first. Loudness and true peak are required; every other section degrades to an
//! explicit "not calculated" / `null` shape when its engine did not deliver.

use crate::models::report::{
    BandReport, DcOffsetReport, DescriptorReport, Diagnostics, DynamicsReport, FileInfo,
    LoudnessReport, PeakReport, SpectralReport, StereoReport, SubBandReport, TechnicalReport,
    TempoReport, TruePeakReport, UniformityReport, REPORT_SCHEMA_VERSION,
};

use super::dynamics::DynamicsRecord;
use super::loudness::LoudnessRecord;
use super::sanitizer::Sanitizer;
use super::segmentation::SegmentedAudio;
use super::spectral::SpectralRecord;
use super::stereo::StereoRecord;
use super::tempo::TempoRecord;
use super::true_peak::TruePeakRecord;
use super::{EngineKind, EngineOutput, EngineResults, PipelineError};

/// Decode metadata carried into the report
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub input_ref: String,
    pub display_name: Option<String>,
    pub decoder: &'static str,
}

pub fn aggregate(
    meta: &FileMeta,
    segmented: &SegmentedAudio,
    results: &EngineResults,
) -> Result<TechnicalReport, PipelineError> {
    let loudness = match results.output(EngineKind::Loudness) {
        Some(EngineOutput::Loudness(record)) => record,
        _ => return Err(results.critical_error(EngineKind::Loudness)),
    };
    let true_peak = match results.output(EngineKind::TruePeak) {
        Some(EngineOutput::TruePeak(record)) => record,
        _ => return Err(results.critical_error(EngineKind::TruePeak)),
    };

    let mut s = Sanitizer::new();
    let audio = segmented.audio();

    let file = FileInfo {
        input_ref: s.text("file.input_ref", &meta.input_ref),
        display_name: s.opt_text("file.display_name", meta.display_name.as_deref()),
        decoder: meta.decoder.to_string(),
        duration_seconds: s.num("file.duration_seconds", audio.duration_seconds()),
        sample_rate: audio.sample_rate(),
        source_channels: audio.source_channels(),
        samples_per_channel: audio.len(),
    };

    let loudness_report = loudness_section(&mut s, loudness);
    let true_peak_report = true_peak_section(&mut s, true_peak);

    let spectral = match results.output(EngineKind::Spectral) {
        Some(EngineOutput::Spectral(record)) => spectral_section(&mut s, record),
        _ => SpectralReport {
            status: crate::pipeline::spectral::SpectralStatus::NotCalculated,
            reason: Some(results.unavailable_reason(EngineKind::Spectral)),
            frames_analyzed: 0,
            bands: Vec::new(),
            descriptors: None,
            dominant_frequencies: Vec::new(),
            sub_bands: Vec::new(),
            uniformity: None,
        },
    };

    let tempo = match results.output(EngineKind::Tempo) {
        Some(EngineOutput::Tempo(record)) => tempo_section(&mut s, record),
        _ => TempoReport {
            bpm: None,
            confidence: None,
            onsets_detected: 0,
            reason: Some(results.unavailable_reason(EngineKind::Tempo)),
        },
    };

    let dynamics = match results.output(EngineKind::Dynamics) {
        Some(EngineOutput::Dynamics(Some(record))) => {
            Some(dynamics_section(&mut s, record, loudness, true_peak))
        }
        _ => None,
    };

    let stereo = match results.output(EngineKind::Stereo) {
        Some(EngineOutput::Stereo(Some(record))) => Some(stereo_section(&mut s, record)),
        _ => None,
    };

    let fft_layout = segmented.fft_layout();
    let loudness_layout = segmented.loudness_layout();
    let diagnostics = Diagnostics {
        engines: results.diagnostics(),
        fft_frames: fft_layout.count,
        loudness_blocks: loudness_layout.count,
        frames_truncated: fft_layout.truncated || loudness_layout.truncated,
        sanitized_fields: Vec::new(),
    };

    Ok(TechnicalReport {
        schema_version: REPORT_SCHEMA_VERSION,
        file,
        loudness: loudness_report,
        true_peak: true_peak_report,
        spectral,
        tempo,
        dynamics,
        stereo,
        diagnostics: Diagnostics {
            sanitized_fields: s.into_trips(),
            ..diagnostics
        },
    })
}

fn loudness_section(s: &mut Sanitizer, r: &LoudnessRecord) -> LoudnessReport {
    LoudnessReport {
        integrated_lufs: s.num("loudness.integrated_lufs", r.integrated),
        short_term_lufs: s.num("loudness.short_term_lufs", r.short_term),
        short_term_max_lufs: s.num("loudness.short_term_max_lufs", r.short_term_max),
        momentary_max_lufs: s.num("loudness.momentary_max_lufs", r.momentary),
        lra_lu: s.num("loudness.lra_lu", r.lra),
        loudness_offset_db: s.opt("loudness.loudness_offset_db", r.loudness_offset_db),
        gated_blocks: r.gated_blocks,
        total_blocks: r.total_blocks,
        partial: r.partial,
    }
}

fn true_peak_section(s: &mut Sanitizer, r: &TruePeakRecord) -> TruePeakReport {
    let [left, right] = r.per_channel_db();
    TruePeakReport {
        max_dbtp: s.num("true_peak.max_dbtp", r.max_dbtp),
        max_linear: s.num("true_peak.max_linear", r.max_linear),
        sample_peak_dbfs: s.num("true_peak.sample_peak_dbfs", r.sample_peak_dbfs),
        per_channel_dbtp: vec![
            s.num("true_peak.per_channel_dbtp[0]", left),
            s.num("true_peak.per_channel_dbtp[1]", right),
        ],
        clipped_samples: r.clipped_samples,
        exceeds_ceiling: r.exceeds_ceiling,
        interpolation: r.interpolation,
        oversampling: r.oversampling,
    }
}

fn spectral_section(s: &mut Sanitizer, r: &SpectralRecord) -> SpectralReport {
    let bands = r
        .bands
        .iter()
        .map(|b| BandReport {
            band: b.band,
            energy_db: s.num(&format!("spectral.bands.{}.energy_db", b.band.key()), b.energy_db),
            percentage: s.num(
                &format!("spectral.bands.{}.percentage", b.band.key()),
                b.percentage,
            ),
        })
        .collect();

    let descriptors = r.descriptors.as_ref().map(|d| DescriptorReport {
        centroid_hz: s.num("spectral.descriptors.centroid_hz", d.centroid_hz),
        rolloff_hz: s.num("spectral.descriptors.rolloff_hz", d.rolloff_hz),
        spread_hz: s.num("spectral.descriptors.spread_hz", d.spread_hz),
        flatness: s.num("spectral.descriptors.flatness", d.flatness),
        crest: s.num("spectral.descriptors.crest", d.crest),
        skewness: s.num("spectral.descriptors.skewness", d.skewness),
        kurtosis: s.num("spectral.descriptors.kurtosis", d.kurtosis),
        zero_crossing_rate: s.num("spectral.descriptors.zero_crossing_rate", d.zero_crossing_rate),
        flux: s.num("spectral.descriptors.flux", d.flux),
    });

    let peaks = r
        .dominant_frequencies
        .iter()
        .enumerate()
        .map(|(i, p)| PeakReport {
            frequency_hz: s.num(
                &format!("spectral.dominant_frequencies[{}].frequency_hz", i),
                p.frequency_hz,
            ),
            magnitude_db: s.num(
                &format!("spectral.dominant_frequencies[{}].magnitude_db", i),
                p.magnitude_db,
            ),
        })
        .collect();

    let sub_bands = r
        .sub_bands
        .iter()
        .map(|b| SubBandReport {
            id: b.id.clone(),
            band: b.band,
            low_hz: b.low_hz,
            high_hz: b.high_hz,
            energy_db: s.num(&format!("spectral.sub_bands.{}.energy_db", b.id), b.energy_db),
        })
        .collect();

    let uniformity = r.uniformity.as_ref().map(|u| UniformityReport {
        std_dev_db: s.num("spectral.uniformity.std_dev_db", u.std_dev_db),
        range_db: s.num("spectral.uniformity.range_db", u.range_db),
        mean_deviation_db: s.num("spectral.uniformity.mean_deviation_db", u.mean_deviation_db),
        rating: u.rating,
        densest_band: u.densest_band,
        weakest_band: u.weakest_band,
        tilt_db: s.num("spectral.uniformity.tilt_db", u.tilt_db),
    });

    SpectralReport {
        status: r.status,
        reason: s.opt_text("spectral.reason", r.reason.as_deref()),
        frames_analyzed: r.frames_analyzed,
        bands: s.cap("spectral.bands", bands),
        descriptors,
        dominant_frequencies: s.cap("spectral.dominant_frequencies", peaks),
        sub_bands: s.cap("spectral.sub_bands", sub_bands),
        uniformity,
    }
}

fn tempo_section(s: &mut Sanitizer, r: &TempoRecord) -> TempoReport {
    let bpm = s.opt("tempo.bpm", r.bpm);
    TempoReport {
        bpm,
        // Confidence is only meaningful next to a tempo
        confidence: bpm.and_then(|_| s.num("tempo.confidence", r.confidence)),
        onsets_detected: r.onsets_detected,
        reason: s.opt_text("tempo.reason", r.reason.as_deref()),
    }
}

fn dynamics_section(
    s: &mut Sanitizer,
    r: &DynamicsRecord,
    loudness: &LoudnessRecord,
    true_peak: &TruePeakRecord,
) -> DynamicsReport {
    DynamicsReport {
        dynamic_range_db: s.num("dynamics.dynamic_range_db", r.dynamic_range_db),
        crest_factor_db: s.num("dynamics.crest_factor_db", r.crest_factor_db),
        rms_dbfs: s.num("dynamics.rms_dbfs", r.rms_dbfs),
        peak_dbfs: s.num("dynamics.peak_dbfs", r.peak_dbfs),
        peak_to_loudness_ratio: s.num(
            "dynamics.peak_to_loudness_ratio",
            true_peak.max_dbtp - loudness.integrated,
        ),
        dc_offset: Some(DcOffsetReport {
            left: s.num("dynamics.dc_offset.left", r.dc_offset.left),
            right: s.num("dynamics.dc_offset.right", r.dc_offset.right),
            max_abs: s.num("dynamics.dc_offset.max_abs", r.dc_offset.max_abs),
            imbalance: s.num("dynamics.dc_offset.imbalance", r.dc_offset.imbalance),
            temporal_variation: s.num(
                "dynamics.dc_offset.temporal_variation",
                r.dc_offset.temporal_variation,
            ),
            severity: r.dc_offset.severity,
        }),
    }
}

fn stereo_section(s: &mut Sanitizer, r: &StereoRecord) -> StereoReport {
    StereoReport {
        correlation: s.num("stereo.correlation", r.correlation),
        width: s.num("stereo.width", r.width),
        balance_db: s.opt("stereo.balance_db", r.balance_db),
        mono_compatible: r.mono_compatible,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::report::EngineOutcome;
    use crate::pipeline::decoder::CanonicalAudio;
    use crate::pipeline::loudness::LoudnessEngine;
    use crate::pipeline::segmentation::{SegmentationOptions, DEFAULT_MAX_FRAMES};
    use crate::pipeline::dynamics::{DcSeverity, DynamicsEngine};
    use crate::pipeline::spectral::{SpectralEngine, SpectralStatus, SUB_BANDS};
    use crate::pipeline::true_peak::{InterpolationOrder, TruePeakEngine};
    use crate::pipeline::EngineRun;
    use std::sync::Arc;

    fn segmented() -> SegmentedAudio {
        let tone: Vec<f32> = (0..48_000)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin())
            .collect();
        let audio = Arc::new(CanonicalAudio::new(tone.clone(), tone, 48_000, 2).unwrap());
        SegmentedAudio::new(
            audio,
            &SegmentationOptions::for_sample_rate(48_000, DEFAULT_MAX_FRAMES),
        )
    }

    fn meta() -> FileMeta {
        FileMeta {
            input_ref: "tone.wav".to_string(),
            display_name: None,
            decoder: "test",
        }
    }

    fn critical_runs(seg: &SegmentedAudio) -> Vec<EngineRun> {
        let audio = seg.audio();
        vec![
            EngineRun::ok(
                EngineKind::Loudness,
                EngineOutput::Loudness(LoudnessEngine::default().measure(
                    audio.left(),
                    audio.right(),
                    audio.sample_rate(),
                    seg.loudness_layout(),
                )),
                3,
            ),
            EngineRun::ok(
                EngineKind::TruePeak,
                EngineOutput::TruePeak(
                    TruePeakEngine::new(InterpolationOrder::Sinc).measure(audio.left(), audio.right()),
                ),
                2,
            ),
        ]
    }

    #[test]
    fn test_degraded_engines_become_explicit_not_calculated() {
        let seg = segmented();
        let mut runs = critical_runs(&seg);
        runs.push(EngineRun::timed_out(EngineKind::Spectral, 60_000));
        runs.push(EngineRun::failed(EngineKind::Tempo, "panicked", 1));

        let report = aggregate(&meta(), &seg, &EngineResults::new(runs)).unwrap();

        assert_eq!(report.spectral.status, SpectralStatus::NotCalculated);
        assert!(report.spectral.reason.as_deref().unwrap().contains("timed out"));
        assert!(report.tempo.bpm.is_none());
        assert!(report.dynamics.is_none());
        assert_eq!(
            report.diagnostics.engines[&EngineKind::Spectral].outcome,
            EngineOutcome::Timeout
        );
        assert!(serde_json::to_string(&report).is_ok());
    }

    #[test]
    fn test_missing_loudness_is_job_level_failure() {
        let seg = segmented();
        let mut runs = critical_runs(&seg);
        runs.remove(0);
        runs.push(EngineRun::timed_out(EngineKind::Loudness, 60_000));

        let err = aggregate(&meta(), &seg, &EngineResults::new(runs)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EngineTimeout {
                engine: EngineKind::Loudness,
                ..
            }
        ));
    }

    #[test]
    fn test_order_of_runs_does_not_matter() {
        let seg = segmented();
        let spectral = || {
            EngineRun::ok(
                EngineKind::Spectral,
                EngineOutput::Spectral(SpectralEngine::new().measure(&seg)),
                5,
            )
        };

        let mut forward = critical_runs(&seg);
        forward.push(spectral());
        let mut backward = vec![spectral()];
        backward.extend(critical_runs(&seg).into_iter().rev());

        let a = aggregate(&meta(), &seg, &EngineResults::new(forward)).unwrap();
        let b = aggregate(&meta(), &seg, &EngineResults::new(backward)).unwrap();
        assert_eq!(a.spectral, b.spectral);
        assert_eq!(a.loudness, b.loudness);
    }

    #[test]
    fn test_spectral_detail_and_dc_offset_reach_the_report() {
        let seg = segmented();
        let mut runs = critical_runs(&seg);
        runs.push(EngineRun::ok(
            EngineKind::Spectral,
            EngineOutput::Spectral(SpectralEngine::new().measure(&seg)),
            5,
        ));
        runs.push(EngineRun::ok(
            EngineKind::Dynamics,
            EngineOutput::Dynamics(DynamicsEngine::new().measure(seg.audio())),
            1,
        ));

        let report = aggregate(&meta(), &seg, &EngineResults::new(runs)).unwrap();

        assert_eq!(report.spectral.sub_bands.len(), SUB_BANDS.len());
        assert!(report.spectral.sub_bands.iter().any(|b| b.id == "mid_low"));
        let dc = report.dynamics.unwrap().dc_offset.unwrap();
        assert_eq!(dc.severity, DcSeverity::Clean);
        assert!(report.diagnostics.sanitized_fields.is_empty());
    }

    #[test]
    fn test_non_finite_record_values_are_nulled_and_recorded() {
        let seg = segmented();
        let mut runs = critical_runs(&seg);
        runs.push(EngineRun::ok(
            EngineKind::Stereo,
            EngineOutput::Stereo(Some(StereoRecord {
                correlation: f64::NAN,
                width: 0.0,
                balance_db: Some(f64::INFINITY),
                mono_compatible: true,
            })),
            1,
        ));

        let report = aggregate(&meta(), &seg, &EngineResults::new(runs)).unwrap();
        let stereo = report.stereo.unwrap();
        assert_eq!(stereo.correlation, None);
        assert_eq!(stereo.width, Some(0.0));
        assert_eq!(stereo.balance_db, None);
        assert_eq!(
            report.diagnostics.sanitized_fields,
            vec!["stereo.correlation".to_string(), "stereo.balance_db".to_string()]
        );
    }
}
