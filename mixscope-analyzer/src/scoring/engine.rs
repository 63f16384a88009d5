//! Score computation

use crate::models::report::TechnicalReport;
use crate::pipeline::spectral::Band;

use super::profile::{ReferenceProfile, Target};
use super::{adaptive, suggestions};
use super::{Classification, MetricKey, MetricScore, ScoringResult};

/// No metric ever scores below this
pub const SCORE_FLOOR: f64 = 10.0;

/// Band deviations up to this many dB score full marks
pub const BAND_SWEET_SPOT_DB: f64 = 4.0;
const BAND_CURVE_EXPONENT: f64 = 1.3;

const WEIGHT_LOUDNESS: f64 = 0.25;
const WEIGHT_TRUE_PEAK: f64 = 0.15;
const WEIGHT_DYNAMICS: f64 = 0.15;
const WEIGHT_STEREO: f64 = 0.10;
const WEIGHT_BANDS: f64 = 0.35;

/// Score caps for hot masters
const CLIPPING_CAP: f64 = 30.0;
const NEAR_CLIPPING_CAP: f64 = 60.0;
const NEAR_CLIPPING_DBTP: f64 = -0.1;

/// Tolerance-zone curve: full credit within tolerance, linear decay to 2× tolerance
pub fn metric_score(deviation: f64, tolerance: f64) -> f64 {
    let d = deviation.abs();
    if tolerance <= 0.0 {
        return if d == 0.0 { 100.0 } else { SCORE_FLOOR };
    }
    if d <= tolerance {
        100.0
    } else if d <= 2.0 * tolerance {
        (100.0 * (2.0 - d / tolerance)).max(SCORE_FLOOR)
    } else {
        SCORE_FLOOR
    }
}

/// Sweet-spot curve for bands: flat to 4 dB, then a power-curve decay to the tolerance edge
pub fn band_score(deviation: f64, tolerance: f64) -> f64 {
    let d = deviation.abs();
    if d <= BAND_SWEET_SPOT_DB {
        return 100.0;
    }
    let edge = (2.0 * tolerance).max(BAND_SWEET_SPOT_DB + tolerance.max(0.0));
    if d >= edge || edge <= BAND_SWEET_SPOT_DB {
        return SCORE_FLOOR;
    }
    let x = (d - BAND_SWEET_SPOT_DB) / (edge - BAND_SWEET_SPOT_DB);
    (100.0 * (1.0 - x.powf(BAND_CURVE_EXPONENT))).max(SCORE_FLOOR)
}

/// Low bands weigh slightly more
pub fn band_weight(band: Band) -> f64 {
    match band {
        Band::Sub | Band::Bass => 1.3,
        Band::LowMid => 1.1,
        Band::Mid => 1.0,
        Band::HighMid => 0.9,
        Band::Presence => 0.8,
        Band::Air => 0.7,
    }
}

fn scored(metric: MetricKey, measured: Option<f64>, target: Option<&Target>) -> Option<MetricScore> {
    let (measured, target) = (measured?, target?);
    let mut deviation = measured - target.target;
    if metric == MetricKey::TruePeak {
        // Ceiling: headroom below the target is fine
        deviation = deviation.max(0.0);
    }
    let score = match metric {
        MetricKey::Band(_) => band_score(deviation, target.tolerance),
        _ => metric_score(deviation, target.tolerance),
    };
    Some(MetricScore {
        metric,
        measured,
        target: target.target,
        tolerance: target.tolerance,
        deviation,
        score,
    })
}

/// Shift applied to measured band levels so they read as if the mix sat at the profile's
/// loudness target. Zero when either side is missing.
pub fn band_level_offset(report: &TechnicalReport, profile: &ReferenceProfile) -> f64 {
    match (report.loudness.integrated_lufs, profile.lufs.as_ref()) {
        (Some(integrated), Some(lufs)) => lufs.target - integrated,
        _ => 0.0,
    }
}

fn weighted_mean(items: impl IntoIterator<Item = (f64, f64)>) -> Option<f64> {
    let (sum, weight) = items
        .into_iter()
        .fold((0.0, 0.0), |(s, w), (value, weight)| (s + value * weight, w + weight));
    (weight > 0.0).then(|| sum / weight)
}

/// Score `report` against `profile`. `previous` is the scoring of an earlier iteration of
/// the same mix, if any.
pub fn score(
    report: &TechnicalReport,
    profile: &ReferenceProfile,
    previous: Option<&ScoringResult>,
) -> ScoringResult {
    let mut per_metric: Vec<MetricScore> = Vec::new();
    let mut groups: Vec<(f64, f64)> = Vec::new();

    let loudness = scored(
        MetricKey::IntegratedLoudness,
        report.loudness.integrated_lufs,
        profile.lufs.as_ref(),
    );
    let true_peak = scored(MetricKey::TruePeak, report.true_peak.max_dbtp, profile.true_peak.as_ref());
    let dynamic_range = scored(
        MetricKey::DynamicRange,
        report.dynamics.as_ref().and_then(|d| d.dynamic_range_db),
        profile.dynamic_range.as_ref(),
    );
    let lra = scored(MetricKey::LoudnessRange, report.loudness.lra_lu, profile.lra.as_ref());
    let stereo = scored(
        MetricKey::StereoCorrelation,
        report.stereo.as_ref().and_then(|s| s.correlation),
        profile.stereo_correlation.as_ref(),
    );

    if let Some(m) = &loudness {
        groups.push((m.score, WEIGHT_LOUDNESS));
    }
    if let Some(m) = &true_peak {
        groups.push((m.score, WEIGHT_TRUE_PEAK));
    }
    if let Some(dynamics) =
        weighted_mean([&dynamic_range, &lra].into_iter().flatten().map(|m| (m.score, 1.0)))
    {
        groups.push((dynamics, WEIGHT_DYNAMICS));
    }
    if let Some(m) = &stereo {
        groups.push((m.score, WEIGHT_STEREO));
    }
    per_metric.extend([loudness, true_peak, dynamic_range, lra, stereo].into_iter().flatten());

    // Tonal balance is judged independently of overall level
    let offset = band_level_offset(report, profile);
    let band_scores: Vec<MetricScore> = Band::ALL
        .into_iter()
        .filter_map(|band| {
            scored(
                MetricKey::Band(band),
                report.band_level(band).map(|level| level + offset),
                profile.bands.get(&band),
            )
        })
        .collect();
    if let Some(bands) = weighted_mean(band_scores.iter().map(|m| {
        let weight = match m.metric {
            MetricKey::Band(band) => band_weight(band),
            _ => 1.0,
        };
        (m.score, weight)
    })) {
        groups.push((bands, WEIGHT_BANDS));
    }
    per_metric.extend(band_scores);

    let score_pct = weighted_mean(groups).map(|raw| {
        let capped = match report.true_peak.max_dbtp {
            Some(tp) if tp > 0.0 => raw.min(CLIPPING_CAP),
            Some(tp) if tp > NEAR_CLIPPING_DBTP => raw.min(NEAR_CLIPPING_CAP),
            _ => raw,
        };
        (capped * 10.0).round() / 10.0
    });

    let suggestions = suggestions::build(&per_metric, report, profile);
    let summary = suggestions::summarize(&suggestions, &per_metric);
    let adaptive = previous.and_then(|prev| adaptive::evaluate(prev, &per_metric));

    ScoringResult {
        profile: profile.name.clone(),
        score_pct,
        classification: score_pct.map(Classification::from_score),
        per_metric,
        suggestions,
        summary,
        adaptive,
    }
}
