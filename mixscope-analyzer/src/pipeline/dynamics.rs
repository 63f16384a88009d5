//! Dynamics: block-RMS dynamic range, crest factor and DC offset
//!
//! 300 ms RMS blocks with a 100 ms hop over the channel-averaged mean square. Blocks
//! quieter than -70 dB are ignored so trailing silence does not inflate the range.
//!
//! DC offset is the per-channel sample mean, plus the spread of 4096-sample window means
//! to tell a constant bias from a drifting one.

use serde::{Deserialize, Serialize};

use super::decoder::CanonicalAudio;

pub const BLOCK_SECONDS: f64 = 0.300;
pub const HOP_SECONDS: f64 = 0.100;
pub const BLOCK_GATE_DB: f64 = -70.0;

pub const DC_WINDOW: usize = 4096;
/// Absolute mean (full scale = 1.0) from which each severity applies
pub const DC_MINOR: f64 = 0.01;
pub const DC_MODERATE: f64 = 0.05;
pub const DC_CRITICAL: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcSeverity {
    Clean,
    Minor,
    Moderate,
    Critical,
}

impl DcSeverity {
    pub fn from_offset(max_abs: f64) -> Self {
        match max_abs {
            d if d >= DC_CRITICAL => DcSeverity::Critical,
            d if d >= DC_MODERATE => DcSeverity::Moderate,
            d if d >= DC_MINOR => DcSeverity::Minor,
            _ => DcSeverity::Clean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcOffset {
    pub left: f64,
    pub right: f64,
    pub max_abs: f64,
    /// `left - right`
    pub imbalance: f64,
    /// Mean over channels of the standard deviation of window means
    pub temporal_variation: f64,
    pub severity: DcSeverity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicsRecord {
    /// Loudest block minus the mean block level
    pub dynamic_range_db: f64,
    /// Sample peak minus overall RMS
    pub crest_factor_db: f64,
    pub rms_dbfs: f64,
    pub peak_dbfs: f64,
    pub blocks_analyzed: usize,
    pub dc_offset: DcOffset,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicsEngine;

impl DynamicsEngine {
    pub fn new() -> Self {
        Self
    }

    /// `None` for empty or fully silent signals
    pub fn measure(&self, audio: &CanonicalAudio) -> Option<DynamicsRecord> {
        if audio.is_empty() {
            return None;
        }
        let rate = audio.sample_rate() as f64;
        let mean_square: Vec<f64> = audio
            .left()
            .iter()
            .zip(audio.right())
            .map(|(l, r)| 0.5 * ((*l as f64).powi(2) + (*r as f64).powi(2)))
            .collect();

        let overall = mean_square.iter().sum::<f64>() / mean_square.len() as f64;
        let peak = audio
            .left()
            .iter()
            .chain(audio.right())
            .fold(0.0f64, |acc, s| acc.max(s.abs() as f64));
        if overall <= 0.0 || peak <= 0.0 {
            return None;
        }

        let block = ((BLOCK_SECONDS * rate).round() as usize).max(1);
        let hop = ((HOP_SECONDS * rate).round() as usize).max(1);
        let levels = block_levels(&mean_square, block, hop);
        let gated: Vec<f64> = levels.into_iter().filter(|db| *db > BLOCK_GATE_DB).collect();
        if gated.is_empty() {
            return None;
        }

        let loudest = gated.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = gated.iter().sum::<f64>() / gated.len() as f64;
        let rms_dbfs = 10.0 * overall.log10();
        let peak_dbfs = 20.0 * peak.log10();

        Some(DynamicsRecord {
            dynamic_range_db: loudest - mean,
            crest_factor_db: peak_dbfs - rms_dbfs,
            rms_dbfs,
            peak_dbfs,
            blocks_analyzed: gated.len(),
            dc_offset: dc_offset(audio.left(), audio.right()),
        })
    }
}

/// Per-channel DC offset
pub fn dc_offset(left: &[f32], right: &[f32]) -> DcOffset {
    let (l, r) = (channel_mean(left), channel_mean(right));
    let max_abs = l.abs().max(r.abs());
    DcOffset {
        left: l,
        right: r,
        max_abs,
        imbalance: l - r,
        temporal_variation: 0.5 * (window_spread(left) + window_spread(right)),
        severity: DcSeverity::from_offset(max_abs),
    }
}

fn channel_mean(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| *s as f64).sum::<f64>() / samples.len() as f64
}

/// Standard deviation of window means; a trailing window counts when at least half full
fn window_spread(samples: &[f32]) -> f64 {
    let means: Vec<f64> = samples
        .chunks(DC_WINDOW)
        .filter(|w| w.len() >= DC_WINDOW / 2)
        .map(channel_mean)
        .collect();
    if means.len() < 2 {
        return 0.0;
    }
    let mean = means.iter().sum::<f64>() / means.len() as f64;
    (means.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / means.len() as f64).sqrt()
}

/// Block levels in dB; a signal shorter than one block is a single block
fn block_levels(mean_square: &[f64], block: usize, hop: usize) -> Vec<f64> {
    let mut prefix = Vec::with_capacity(mean_square.len() + 1);
    prefix.push(0.0);
    for ms in mean_square {
        prefix.push(prefix[prefix.len() - 1] + ms);
    }

    let to_db = |sum: f64, n: usize| {
        let ms = sum / n as f64;
        if ms > 0.0 {
            10.0 * ms.log10()
        } else {
            f64::NEG_INFINITY
        }
    };

    if mean_square.len() < block {
        return vec![to_db(prefix[mean_square.len()], mean_square.len())];
    }
    (0..=(mean_square.len() - block) / hop)
        .map(|i| {
            let start = i * hop;
            to_db(prefix[start + block] - prefix[start], block)
        })
        .collect()
}
