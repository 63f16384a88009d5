//! Correction tickets
//!
//! One ticket per out-of-tolerance metric; bands inside the scoring sweet spot get none,
//! so a full-marks band never asks for a correction. Displayed corrections on dB metrics are capped at
//! [`MUSICAL_CAP_DB`]; the real difference is kept in `delta` and spelled out in the
//! annotation. A report with nothing out of tolerance yields informational tickets, so the
//! list is never empty once scoring has run.

use serde::{Deserialize, Serialize};

use crate::models::report::TechnicalReport;
use crate::pipeline::loudness::STREAMING_REFERENCE_LUFS;

use super::engine::BAND_SWEET_SPOT_DB;
use super::profile::ReferenceProfile;
use super::{MetricKey, MetricScore};

/// Largest correction shown in a single step
pub const MUSICAL_CAP_DB: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    // Declaration order is sort order: most severe first
    Critical,
    Moderate,
    Minor,
    Info,
}

impl Severity {
    /// Severity by deviation in tolerance units; `None` inside tolerance
    pub fn from_ratio(ratio: f64) -> Option<Self> {
        match ratio {
            r if r <= 1.0 => None,
            r if r <= 2.0 => Some(Severity::Minor),
            r if r <= 3.0 => Some(Severity::Moderate),
            _ => Some(Severity::Critical),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub metric: MetricKey,
    pub severity: Severity,
    pub measured: Option<f64>,
    pub target: Option<f64>,
    pub tolerance: Option<f64>,
    /// Correction to apply, `target - measured`
    pub delta: Option<f64>,
    /// `delta` limited to the musical cap
    pub display_delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    pub message: String,
    pub action: String,
}

impl Suggestion {
    pub fn is_info(&self) -> bool {
        self.severity == Severity::Info
    }

    fn info(metric: MetricKey, message: String, action: String) -> Self {
        Self {
            metric,
            severity: Severity::Info,
            measured: None,
            target: None,
            tolerance: None,
            delta: None,
            display_delta: None,
            annotation: None,
            message,
            action,
        }
    }
}

/// Limit `delta` to `±cap`; when capping applies, an annotation with the real value
pub fn cap_delta(delta: f64, cap: f64) -> (f64, Option<String>) {
    if delta.abs() <= cap {
        (delta, None)
    } else {
        let capped = cap.copysign(delta);
        (
            capped,
            Some(format!(
                "capped at {:+.1} dB (real difference: {:+.1} dB)",
                capped, delta
            )),
        )
    }
}

pub fn build(
    metrics: &[MetricScore],
    report: &TechnicalReport,
    profile: &ReferenceProfile,
) -> Vec<Suggestion> {
    let mut tickets: Vec<(f64, Suggestion)> = metrics
        .iter()
        .filter_map(|m| ticket(m, report).map(|t| (m.deviation.abs() / m.tolerance.max(1e-9), t)))
        .collect();

    if tickets.is_empty() {
        return clean_report(report, profile);
    }

    tickets.sort_by(|(ra, a), (rb, b)| a.severity.cmp(&b.severity).then(rb.total_cmp(ra)));
    tickets.into_iter().map(|(_, t)| t).collect()
}

fn ticket(m: &MetricScore, report: &TechnicalReport) -> Option<Suggestion> {
    if matches!(m.metric, MetricKey::Band(_)) && m.deviation.abs() <= BAND_SWEET_SPOT_DB {
        return None;
    }
    let ratio = m.deviation.abs() / m.tolerance.max(1e-9);
    let clipping = m.metric == MetricKey::TruePeak && m.measured > 0.0;
    let severity = if clipping {
        Severity::Critical
    } else {
        Severity::from_ratio(ratio)?
    };

    let delta = if m.metric == MetricKey::TruePeak {
        -m.deviation
    } else {
        m.target - m.measured
    };
    let (display_delta, annotation) = if m.metric.is_decibel() {
        cap_delta(delta, MUSICAL_CAP_DB)
    } else {
        (delta, None)
    };

    let (message, action) = describe(m, display_delta, report);
    Some(Suggestion {
        metric: m.metric,
        severity,
        measured: Some(m.measured),
        target: Some(m.target),
        tolerance: Some(m.tolerance),
        delta: Some(delta),
        display_delta: Some(display_delta),
        annotation,
        message,
        action,
    })
}

fn describe(m: &MetricScore, shown: f64, report: &TechnicalReport) -> (String, String) {
    let amount = shown.abs();
    let direction = if m.measured > m.target { "above" } else { "below" };
    let message = format!(
        "{} is {:.1} {} {} target ({:.1} vs {:.1})",
        m.metric.label(),
        (m.measured - m.target).abs(),
        m.metric.unit(),
        direction,
        m.measured,
        m.target
    )
    .replace("  ", " ");

    let action = match m.metric {
        MetricKey::IntegratedLoudness if shown > 0.0 => {
            format!("Raise the master gain by about {:.1} dB, watching the limiter", amount)
        }
        MetricKey::IntegratedLoudness => {
            format!("Lower the master level or limiter drive by about {:.1} dB", amount)
        }
        MetricKey::TruePeak => {
            let clipped = report.true_peak.clipped_samples;
            if clipped > 0 {
                format!(
                    "Lower the limiter ceiling by {:.1} dB; {} samples are at full scale",
                    amount, clipped
                )
            } else {
                format!("Lower the limiter ceiling by {:.1} dB and enable true-peak limiting", amount)
            }
        }
        MetricKey::DynamicRange if shown > 0.0 => {
            "Ease off bus compression and limiting to recover transients".to_string()
        }
        MetricKey::DynamicRange => {
            "Tighten dynamics with gentle bus compression".to_string()
        }
        MetricKey::LoudnessRange if shown > 0.0 => {
            "Let sections breathe: automate level between verse and drop".to_string()
        }
        MetricKey::LoudnessRange => {
            "Even out section levels with automation or slow compression".to_string()
        }
        MetricKey::StereoCorrelation if shown > 0.0 => {
            "Check wide elements for phase issues and keep low end mono".to_string()
        }
        MetricKey::StereoCorrelation => {
            "Widen the mix with panning or stereo effects on upper elements".to_string()
        }
        MetricKey::Band(band) => {
            let (lo, hi) = band.range_hz();
            let verb = if shown > 0.0 { "Boost" } else { "Cut" };
            format!(
                "{} {} ({:.0}–{:.0} Hz) by about {:.1} dB",
                verb,
                band.label().to_lowercase(),
                lo,
                hi,
                amount
            )
        }
        MetricKey::Overall => String::new(),
    };
    (message, action)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryRating {
    Excellent,
    Good,
    NeedsWork,
    Poor,
}

/// Roll-up of a ticket list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionSummary {
    pub critical: usize,
    pub moderate: usize,
    pub minor: usize,
    pub info: usize,
    pub metrics_scored: usize,
    /// Metrics scoring full marks
    pub metrics_in_tolerance: usize,
    pub rating: SummaryRating,
    /// No critical ticket and at most two moderate ones
    pub ready_for_release: bool,
    /// 0–10: 4 points per critical, 1 per moderate, half per minor
    pub score: f64,
    /// Metric of the most urgent actionable ticket
    pub top_priority: Option<MetricKey>,
}

/// Moderate tickets tolerated in a release-ready mix
const RELEASE_MAX_MODERATE: usize = 2;

pub fn summarize(suggestions: &[Suggestion], metrics: &[MetricScore]) -> SuggestionSummary {
    let count = |severity| suggestions.iter().filter(|s| s.severity == severity).count();
    let (critical, moderate, minor, info) = (
        count(Severity::Critical),
        count(Severity::Moderate),
        count(Severity::Minor),
        count(Severity::Info),
    );

    let rating = if critical > 0 {
        SummaryRating::Poor
    } else if moderate > RELEASE_MAX_MODERATE {
        SummaryRating::NeedsWork
    } else if moderate + minor > 0 {
        SummaryRating::Good
    } else {
        SummaryRating::Excellent
    };
    let penalty = 4.0 * critical as f64 + moderate as f64 + 0.5 * minor as f64;

    SuggestionSummary {
        critical,
        moderate,
        minor,
        info,
        metrics_scored: metrics.len(),
        metrics_in_tolerance: metrics.iter().filter(|m| m.score >= 100.0).count(),
        rating,
        ready_for_release: critical == 0 && moderate <= RELEASE_MAX_MODERATE,
        score: (10.0 - penalty).max(0.0),
        top_priority: suggestions.iter().find(|s| !s.is_info()).map(|s| s.metric),
    }
}

/// Informational tickets for a mix with nothing out of tolerance
fn clean_report(report: &TechnicalReport, profile: &ReferenceProfile) -> Vec<Suggestion> {
    let mut tickets = vec![Suggestion::info(
        MetricKey::Overall,
        format!(
            "Every measured metric is within tolerance of the {} profile",
            profile.label()
        ),
        "No corrections needed; compare against a reference track before release".to_string(),
    )];

    if let Some(integrated) = report.loudness.integrated_lufs {
        let offset = STREAMING_REFERENCE_LUFS - integrated;
        let note = if offset < 0.0 {
            format!(
                "Streaming platforms normalizing to {:.0} LUFS will turn this mix down by {:.1} dB",
                STREAMING_REFERENCE_LUFS, -offset
            )
        } else {
            format!(
                "Integrated loudness is {:.1} LUFS, {:.1} dB under the {:.0} LUFS streaming reference",
                integrated, offset, STREAMING_REFERENCE_LUFS
            )
        };
        tickets.push(Suggestion::info(
            MetricKey::IntegratedLoudness,
            note,
            "Keep this loudness unless the release targets a louder platform".to_string(),
        ));
    }

    if let Some(tp) = report.true_peak.max_dbtp {
        tickets.push(Suggestion::info(
            MetricKey::TruePeak,
            format!("True peak sits at {:.1} dBTP", tp),
            "Leave at least 1 dB of true-peak headroom for lossy encoding".to_string(),
        ));
    }

    tickets
}
