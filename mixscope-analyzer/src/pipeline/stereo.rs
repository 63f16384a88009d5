//! Stereo image: correlation, width and balance

use serde::{Deserialize, Serialize};

use super::decoder::CanonicalAudio;

const SILENCE_ENERGY: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoRecord {
    /// Pearson correlation of L and R in [-1, 1]
    pub correlation: f64,
    /// `2·side_rms / (mid_rms + side_rms)`: 0 mono, 1 uncorrelated, 2 out of phase
    pub width: f64,
    /// Left over right RMS in dB, `None` when either side is silent
    pub balance_db: Option<f64>,
    pub mono_compatible: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StereoEngine;

impl StereoEngine {
    pub fn new() -> Self {
        Self
    }

    /// `None` for empty or fully silent signals
    pub fn measure(&self, audio: &CanonicalAudio) -> Option<StereoRecord> {
        let (left, right) = (audio.left(), audio.right());
        if left.is_empty() {
            return None;
        }
        let n = left.len() as f64;

        let (mut sum_l, mut sum_r) = (0.0f64, 0.0f64);
        let (mut sq_l, mut sq_r, mut cross) = (0.0f64, 0.0f64, 0.0f64);
        let (mut mid, mut side) = (0.0f64, 0.0f64);
        for (l, r) in left.iter().zip(right) {
            let (l, r) = (*l as f64, *r as f64);
            sum_l += l;
            sum_r += r;
            sq_l += l * l;
            sq_r += r * r;
            cross += l * r;
            mid += (0.5 * (l + r)).powi(2);
            side += (0.5 * (l - r)).powi(2);
        }
        if sq_l + sq_r <= SILENCE_ENERGY {
            return None;
        }

        let var_l = sq_l - sum_l * sum_l / n;
        let var_r = sq_r - sum_r * sum_r / n;
        let correlation = if var_l <= SILENCE_ENERGY || var_r <= SILENCE_ENERGY {
            0.0
        } else {
            ((cross - sum_l * sum_r / n) / (var_l * var_r).sqrt()).clamp(-1.0, 1.0)
        };

        let (mid_rms, side_rms) = ((mid / n).sqrt(), (side / n).sqrt());
        let width = if mid_rms + side_rms > 0.0 {
            2.0 * side_rms / (mid_rms + side_rms)
        } else {
            0.0
        };

        let balance_db = if sq_l > SILENCE_ENERGY && sq_r > SILENCE_ENERGY {
            Some(10.0 * (sq_l / sq_r).log10())
        } else {
            None
        };

        Some(StereoRecord {
            correlation,
            width,
            balance_db,
            mono_compatible: correlation >= 0.0,
        })
    }
}
