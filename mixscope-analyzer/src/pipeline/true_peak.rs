//! True-peak engine
//!
//! Sample peak first, then an inter-sample estimate from 4x oversampling. The
//! interpolation order is an explicit parameter:
//! - `Linear`: straight line between neighbours (lower bound, never overshoots)
//! - `Cubic`: Catmull-Rom through four neighbours
//! - `Sinc`: Hann-windowed sinc, 16 taps each side, each phase normalized to unit DC gain
//!
//! The reported true peak is never below the sample peak.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const OVERSAMPLING_FACTOR: usize = 4;
/// Reported for exact digital silence
pub const TRUE_PEAK_FLOOR_DBTP: f64 = -120.0;
/// Samples at or above this magnitude count as clipped
pub const CLIP_THRESHOLD: f32 = 0.999;
/// Broadcast/streaming true-peak ceiling
pub const TRUE_PEAK_CEILING_DBTP: f64 = -1.0;

const SINC_HALF_TAPS: usize = 16;
/// Samples scanned per block when skipping quiet regions
const SCAN_BLOCK: usize = 64;

/// Interpolation used between original samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationOrder {
    Linear,
    Cubic,
    #[default]
    Sinc,
}

/// Peaks of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPeak {
    pub sample_peak_linear: f64,
    pub sample_peak_dbfs: f64,
    pub true_peak_linear: f64,
    pub true_peak_dbtp: f64,
    pub clipped_samples: usize,
}

/// True-peak measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruePeakRecord {
    pub max_dbtp: f64,
    pub max_linear: f64,
    pub sample_peak_dbfs: f64,
    pub sample_peak_linear: f64,
    pub left: ChannelPeak,
    pub right: ChannelPeak,
    pub clipped_samples: usize,
    pub exceeds_ceiling: bool,
    pub interpolation: InterpolationOrder,
    pub oversampling: usize,
}

impl TruePeakRecord {
    /// Per-channel true peaks in dBTP, left first
    pub fn per_channel_db(&self) -> [f64; 2] {
        [self.left.true_peak_dbtp, self.right.true_peak_dbtp]
    }
}

/// Linear amplitude to dB with the silence floor
pub fn linear_to_db(value: f64) -> f64 {
    if value > 0.0 {
        (20.0 * value.log10()).max(TRUE_PEAK_FLOOR_DBTP)
    } else {
        TRUE_PEAK_FLOOR_DBTP
    }
}

/// Oversampling peak estimator
#[derive(Debug, Clone)]
pub struct TruePeakEngine {
    order: InterpolationOrder,
    factor: usize,
    /// Sinc weights per fractional phase, taps from -(H-1) to +H
    sinc_phases: Vec<Vec<f64>>,
    /// Largest L1 norm of any phase's weights; bounds an interpolated value by the local
    /// sample maximum
    max_gain: f64,
}

impl Default for TruePeakEngine {
    fn default() -> Self {
        Self::new(InterpolationOrder::default())
    }
}

impl TruePeakEngine {
    pub fn new(order: InterpolationOrder) -> Self {
        Self::with_factor(order, OVERSAMPLING_FACTOR)
    }

    pub fn with_factor(order: InterpolationOrder, factor: usize) -> Self {
        let factor = factor.max(1);
        let sinc_phases = if order == InterpolationOrder::Sinc {
            (1..factor)
                .map(|p| sinc_phase(p as f64 / factor as f64))
                .collect()
        } else {
            Vec::new()
        };

        let max_gain = match order {
            InterpolationOrder::Linear => 1.0,
            InterpolationOrder::Cubic => (1..factor)
                .map(|p| {
                    catmull_rom_weights(p as f64 / factor as f64)
                        .iter()
                        .map(|w| w.abs())
                        .sum::<f64>()
                })
                .fold(1.0, f64::max),
            InterpolationOrder::Sinc => sinc_phases
                .iter()
                .map(|w| w.iter().map(|x| x.abs()).sum::<f64>())
                .fold(1.0, f64::max),
        };

        Self {
            order,
            factor,
            sinc_phases,
            max_gain,
        }
    }

    pub fn order(&self) -> InterpolationOrder {
        self.order
    }

    pub fn measure(&self, left: &[f32], right: &[f32]) -> TruePeakRecord {
        let left = self.measure_channel(left);
        let right = self.measure_channel(right);

        let max_linear = left.true_peak_linear.max(right.true_peak_linear);
        let sample_peak_linear = left.sample_peak_linear.max(right.sample_peak_linear);
        let max_dbtp = linear_to_db(max_linear);

        TruePeakRecord {
            max_dbtp,
            max_linear,
            sample_peak_dbfs: linear_to_db(sample_peak_linear),
            sample_peak_linear,
            clipped_samples: left.clipped_samples + right.clipped_samples,
            exceeds_ceiling: max_dbtp > TRUE_PEAK_CEILING_DBTP,
            left,
            right,
            interpolation: self.order,
            oversampling: self.factor,
        }
    }

    fn measure_channel(&self, samples: &[f32]) -> ChannelPeak {
        let mut sample_peak = 0.0f64;
        let mut clipped_samples = 0;
        for &s in samples {
            let a = s.abs();
            if a >= CLIP_THRESHOLD {
                clipped_samples += 1;
            }
            sample_peak = sample_peak.max(a as f64);
        }

        let true_peak = if self.factor > 1 && sample_peak > 0.0 {
            self.interpolated_peak(samples, sample_peak).max(sample_peak)
        } else {
            sample_peak
        };

        ChannelPeak {
            sample_peak_linear: sample_peak,
            sample_peak_dbfs: linear_to_db(sample_peak),
            true_peak_linear: true_peak,
            true_peak_dbtp: linear_to_db(true_peak),
            clipped_samples,
        }
    }

    /// Maximum magnitude over all interpolated points.
    ///
    /// Blocks whose neighbourhood cannot produce a value above the running maximum are
    /// skipped; `max_gain` makes the skip exact.
    fn interpolated_peak(&self, samples: &[f32], sample_peak: f64) -> f64 {
        let n = samples.len();
        if n < 2 {
            return sample_peak;
        }
        let reach = match self.order {
            InterpolationOrder::Linear => 1,
            InterpolationOrder::Cubic => 2,
            InterpolationOrder::Sinc => SINC_HALF_TAPS,
        };

        let mut best = sample_peak;
        let mut block_start = 0;
        while block_start < n - 1 {
            let block_end = (block_start + SCAN_BLOCK).min(n - 1);
            let lo = block_start.saturating_sub(reach);
            let hi = (block_end + reach).min(n);
            let local_max = samples[lo..hi]
                .iter()
                .fold(0.0f32, |m, s| m.max(s.abs())) as f64;

            if local_max * self.max_gain > best {
                for i in block_start..block_end {
                    for phase in 1..self.factor {
                        let value = self.interpolate(samples, i, phase).abs();
                        if value > best {
                            best = value;
                        }
                    }
                }
            }
            block_start = block_end;
        }

        best
    }

    /// Value at position `i + phase/factor`
    fn interpolate(&self, samples: &[f32], i: usize, phase: usize) -> f64 {
        let at = |k: isize| -> f64 {
            let idx = i as isize + k;
            if idx < 0 || idx as usize >= samples.len() {
                0.0
            } else {
                samples[idx as usize] as f64
            }
        };
        let t = phase as f64 / self.factor as f64;

        match self.order {
            InterpolationOrder::Linear => at(0) + t * (at(1) - at(0)),
            InterpolationOrder::Cubic => {
                let w = catmull_rom_weights(t);
                w[0] * at(-1) + w[1] * at(0) + w[2] * at(1) + w[3] * at(2)
            }
            InterpolationOrder::Sinc => {
                let weights = &self.sinc_phases[phase - 1];
                let first = -(SINC_HALF_TAPS as isize) + 1;
                weights
                    .iter()
                    .enumerate()
                    .map(|(j, w)| w * at(first + j as isize))
                    .sum()
            }
        }
    }
}

/// Catmull-Rom weights for samples at offsets -1, 0, 1, 2
fn catmull_rom_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        0.5 * (-t3 + 2.0 * t2 - t),
        0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
        0.5 * (-3.0 * t3 + 4.0 * t2 + t),
        0.5 * (t3 - t2),
    ]
}

/// Windowed-sinc weights for fractional offset `t`, normalized to sum to one
fn sinc_phase(t: f64) -> Vec<f64> {
    let half = SINC_HALF_TAPS as f64;
    let first = -(SINC_HALF_TAPS as isize) + 1;
    let mut weights: Vec<f64> = (0..2 * SINC_HALF_TAPS)
        .map(|j| {
            let x = (first + j as isize) as f64 - t;
            let sinc = if x.abs() < 1e-12 {
                1.0
            } else {
                (PI * x).sin() / (PI * x)
            };
            let window = if x.abs() < half {
                0.5 * (1.0 + (PI * x / half).cos())
            } else {
                0.0
            };
            sinc * window
        })
        .collect();

    let sum: f64 = weights.iter().sum();
    if sum.abs() > 1e-12 {
        for w in &mut weights {
            *w /= sum;
        }
    }
    weights
}
