//! Adaptive re-scoring across iterations
//!
//! Measures how much of each previously suggested band correction was actually applied.
//! Both iterations are compared on loudness-normalized band levels, so turning the whole
//! master up or down does not read as an EQ move. The result is reported next to the main
//! score and never folded into it.

use serde::{Deserialize, Serialize};

use crate::pipeline::spectral::Band;

use super::{MetricKey, MetricScore, ScoringResult, Severity};

/// Corrections smaller than this are not tracked
const MIN_EXPECTED_DB: f64 = 0.1;

const WRONG_DIRECTION_CREDIT: f64 = 10.0;
const OVERSHOOT_FLOOR: f64 = 40.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandProgress {
    pub band: Band,
    /// Correction suggested last time, `target - previous measurement`
    pub expected_db: f64,
    /// `current measurement - previous measurement`
    pub applied_db: f64,
    pub ratio: f64,
    pub credit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveScore {
    /// Mean band credit, 0–100
    pub score: f64,
    pub bands: Vec<BandProgress>,
}

/// Credit for applying `ratio` of the expected correction
pub fn progress_credit(ratio: f64) -> f64 {
    if ratio <= 0.0 {
        WRONG_DIRECTION_CREDIT
    } else if ratio <= 1.0 {
        WRONG_DIRECTION_CREDIT + 90.0 * ratio
    } else {
        (100.0 - 60.0 * (ratio - 1.0)).max(OVERSHOOT_FLOOR)
    }
}

/// `None` when the previous iteration had no actionable band tickets. `current` is the
/// per-metric detail of the iteration being scored.
pub fn evaluate(previous: &ScoringResult, current: &[MetricScore]) -> Option<AdaptiveScore> {
    let bands: Vec<BandProgress> = previous
        .suggestions
        .iter()
        .filter(|s| s.severity != Severity::Info)
        .filter_map(|s| {
            let band = match s.metric {
                MetricKey::Band(band) => band,
                _ => return None,
            };
            let expected = s.delta?;
            let previous_level = s.measured?;
            if expected.abs() < MIN_EXPECTED_DB {
                return None;
            }
            let current_level = current
                .iter()
                .find(|m| m.metric == MetricKey::Band(band))?
                .measured;

            let applied = current_level - previous_level;
            let ratio = applied / expected;
            Some(BandProgress {
                band,
                expected_db: expected,
                applied_db: applied,
                ratio,
                credit: progress_credit(ratio),
            })
        })
        .collect();

    if bands.is_empty() {
        return None;
    }
    let score = bands.iter().map(|b| b.credit).sum::<f64>() / bands.len() as f64;
    Some(AdaptiveScore {
        score: (score * 10.0).round() / 10.0,
        bands,
    })
}
