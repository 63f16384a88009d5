//! Loudness (LUFS) engine
//!
//! ITU-R BS.1770 style measurement:
//! 1. K-weight each channel (high-shelf pre-filter, then RLB high-pass)
//! 2. Accumulate mean-square energy per 100 ms hop
//! 3. Form 400 ms gating blocks from four consecutive hops (75% overlap)
//! 4. Integrated loudness with an absolute gate (-70 LUFS) then a relative gate (-10 LU)
//! 5. Short-term loudness from 3 s windows (30 hops), momentary from 400 ms blocks
//! 6. Loudness range: P95 - P10 of short-term values passing an absolute gate (-70 LUFS)
//!    and a relative gate 20 LU below their power mean (EBU Tech 3342)
//!
//! Hop and block count come from the segmentation's loudness layout, so the block
//! ceiling is applied once. Silent input yields the -70 LUFS floor, never -inf or NaN. The
//! hop loop checks elapsed wall-clock time and returns partial results when the budget
//! runs out.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::time::{Duration, Instant};
use tracing::warn;

use super::segmentation::{FrameLayout, LOUDNESS_HOPS_PER_BLOCK};

pub const ABSOLUTE_GATE_LUFS: f64 = -70.0;
pub const RELATIVE_GATE_LU: f64 = -10.0;
/// Loudness range gate, relative to the power mean of absolute-gated short-term values
pub const LRA_RELATIVE_GATE_LU: f64 = -20.0;
/// Reported in place of -inf when nothing survives gating
pub const LOUDNESS_FLOOR_LUFS: f64 = -70.0;
/// Streaming platform reference level used for the offset
pub const STREAMING_REFERENCE_LUFS: f64 = -14.0;

/// 3 s short-term window in 100 ms hops
const SHORT_TERM_HOPS: usize = 30;
/// Hops between wall-clock checks
const BUDGET_CHECK_INTERVAL: usize = 1000;

/// Loudness measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoudnessRecord {
    /// Gated integrated loudness (LUFS)
    pub integrated: f64,
    /// Median of gated short-term values (LUFS)
    pub short_term: f64,
    pub short_term_max: f64,
    /// Loudest 400 ms block (LUFS)
    pub momentary: f64,
    /// Loudness range (LU)
    pub lra: f64,
    /// Gain needed to reach the streaming reference, absent for silence
    pub loudness_offset_db: Option<f64>,
    pub gated_blocks: usize,
    pub total_blocks: usize,
    /// Wall-clock budget ran out before the whole signal was measured
    pub partial: bool,
}

/// Second-order IIR section, transposed direct form II
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn new(b: [f64; 3], a: [f64; 2]) -> Self {
        Self {
            b0: b[0],
            b1: b[1],
            b2: b[2],
            a1: a[0],
            a2: a[1],
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }
}

/// K-weighting cascade for `sample_rate`, derived by bilinear transform so rates other
/// than 48 kHz get the correct response
fn k_weighting(sample_rate: u32) -> [Biquad; 2] {
    let fs = sample_rate as f64;

    // Stage 1: high-frequency shelf (+4 dB above ~1.7 kHz)
    let f0 = 1681.974_450_955_533;
    let gain_db = 3.999_843_853_973_347;
    let q = 0.707_175_236_955_419_6;
    let k = (PI * f0 / fs).tan();
    let vh = 10f64.powf(gain_db / 20.0);
    let vb = vh.powf(0.499_666_774_154_541_6);
    let a0 = 1.0 + k / q + k * k;
    let shelf = Biquad::new(
        [
            (vh + vb * k / q + k * k) / a0,
            2.0 * (k * k - vh) / a0,
            (vh - vb * k / q + k * k) / a0,
        ],
        [2.0 * (k * k - 1.0) / a0, (1.0 - k / q + k * k) / a0],
    );

    // Stage 2: RLB high-pass (~38 Hz)
    let f0 = 38.135_470_876_024_44;
    let q = 0.500_327_037_323_877_3;
    let k = (PI * f0 / fs).tan();
    let a0 = 1.0 + k / q + k * k;
    let high_pass = Biquad::new(
        [1.0, -2.0, 1.0],
        [2.0 * (k * k - 1.0) / a0, (1.0 - k / q + k * k) / a0],
    );

    [shelf, high_pass]
}

#[inline]
fn block_loudness(mean_square_sum: f64) -> f64 {
    if mean_square_sum > 0.0 {
        -0.691 + 10.0 * mean_square_sum.log10()
    } else {
        f64::NEG_INFINITY
    }
}

/// Loudness engine
#[derive(Debug, Clone)]
pub struct LoudnessEngine {
    budget: Duration,
}

impl Default for LoudnessEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl LoudnessEngine {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// Measure a stereo signal over the blocks of `layout`. Channels are weighted equally.
    pub fn measure(
        &self,
        left: &[f32],
        right: &[f32],
        sample_rate: u32,
        layout: FrameLayout,
    ) -> LoudnessRecord {
        let started = Instant::now();
        let hop = layout.hop.max(1);
        let len = left.len().min(right.len());
        // A block spans four hops, each block after the first adds one
        let n_hops = if layout.count == 0 {
            0
        } else {
            (layout.count + LOUDNESS_HOPS_PER_BLOCK - 1).min(len / hop)
        };

        let mut filters_l = k_weighting(sample_rate);
        let mut filters_r = k_weighting(sample_rate);
        let mut hop_energy: Vec<f64> = Vec::with_capacity(n_hops);
        let mut partial = false;

        for h in 0..n_hops {
            if h > 0 && h % BUDGET_CHECK_INTERVAL == 0 && started.elapsed() > self.budget {
                warn!(
                    hops_measured = h,
                    hops_total = n_hops,
                    budget_ms = self.budget.as_millis() as u64,
                    "Loudness measurement exceeded wall-clock budget, returning partial result"
                );
                partial = true;
                break;
            }

            let range = h * hop..(h + 1) * hop;
            let mut sum_l = 0.0;
            for &x in &left[range.clone()] {
                let s = filters_l[0].process(x as f64);
                let y = filters_l[1].process(s);
                sum_l += y * y;
            }
            let mut sum_r = 0.0;
            for &x in &right[range] {
                let s = filters_r[0].process(x as f64);
                let y = filters_r[1].process(s);
                sum_r += y * y;
            }
            // Channel mean squares summed with unit weights
            hop_energy.push((sum_l + sum_r) / hop as f64);
        }

        summarize(&hop_energy, partial)
    }
}

/// Gate and summarize per-hop energies
fn summarize(hop_energy: &[f64], partial: bool) -> LoudnessRecord {
    let mut prefix = Vec::with_capacity(hop_energy.len() + 1);
    prefix.push(0.0);
    for e in hop_energy {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + e);
    }
    let window_energy = |start: usize, hops: usize| (prefix[start + hops] - prefix[start]) / hops as f64;

    // 400 ms gating blocks
    let blocks: Vec<f64> = if hop_energy.len() >= LOUDNESS_HOPS_PER_BLOCK {
        (0..=hop_energy.len() - LOUDNESS_HOPS_PER_BLOCK)
            .map(|i| window_energy(i, LOUDNESS_HOPS_PER_BLOCK))
            .collect()
    } else {
        Vec::new()
    };

    let (integrated, gated_blocks) = integrated_loudness(&blocks);

    let momentary = blocks
        .iter()
        .map(|&e| block_loudness(e))
        .fold(LOUDNESS_FLOOR_LUFS, f64::max);

    // 3 s windows; signals shorter than that use everything available
    let short_term_values: Vec<f64> = if hop_energy.len() >= SHORT_TERM_HOPS {
        (0..=hop_energy.len() - SHORT_TERM_HOPS)
            .map(|i| block_loudness(window_energy(i, SHORT_TERM_HOPS)))
            .collect()
    } else if hop_energy.len() >= LOUDNESS_HOPS_PER_BLOCK {
        vec![block_loudness(window_energy(0, hop_energy.len()))]
    } else {
        Vec::new()
    };

    let short_term_max = short_term_values
        .iter()
        .copied()
        .fold(LOUDNESS_FLOOR_LUFS, f64::max);

    let is_silent = gated_blocks == 0;

    let mut active: Vec<f64> = short_term_values
        .iter()
        .copied()
        .filter(|&l| l > ABSOLUTE_GATE_LUFS && l >= integrated + RELATIVE_GATE_LU)
        .collect();
    let short_term = if is_silent || active.is_empty() {
        LOUDNESS_FLOOR_LUFS
    } else {
        median(&mut active)
    };

    let lra = if is_silent { 0.0 } else { loudness_range(&short_term_values) };

    LoudnessRecord {
        integrated,
        short_term,
        short_term_max,
        momentary,
        lra,
        loudness_offset_db: (!is_silent).then(|| STREAMING_REFERENCE_LUFS - integrated),
        gated_blocks,
        total_blocks: blocks.len(),
        partial,
    }
}

/// P95 - P10 of the short-term values that pass the absolute gate and sit within 20 LU
/// of the power mean of those values
fn loudness_range(short_term_values: &[f64]) -> f64 {
    let above_absolute: Vec<f64> = short_term_values
        .iter()
        .copied()
        .filter(|&l| l > ABSOLUTE_GATE_LUFS)
        .collect();
    if above_absolute.len() < 2 {
        return 0.0;
    }

    let power_mean = 10.0
        * (above_absolute.iter().map(|l| 10f64.powf(l / 10.0)).sum::<f64>()
            / above_absolute.len() as f64)
            .log10();
    let gate = power_mean + LRA_RELATIVE_GATE_LU;

    let mut gated: Vec<f64> = above_absolute.into_iter().filter(|&l| l >= gate).collect();
    if gated.len() < 2 {
        return 0.0;
    }
    gated.sort_by(f64::total_cmp);
    (percentile(&gated, 0.95) - percentile(&gated, 0.10)).max(0.0)
}

/// Two-stage gated mean. Returns the floor and zero blocks when nothing passes.
fn integrated_loudness(blocks: &[f64]) -> (f64, usize) {
    let above_absolute: Vec<f64> = blocks
        .iter()
        .copied()
        .filter(|&e| block_loudness(e) > ABSOLUTE_GATE_LUFS)
        .collect();
    if above_absolute.is_empty() {
        return (LOUDNESS_FLOOR_LUFS, 0);
    }

    let provisional = block_loudness(mean(&above_absolute));
    let relative_gate = provisional + RELATIVE_GATE_LU;

    let gated: Vec<f64> = above_absolute
        .into_iter()
        .filter(|&e| block_loudness(e) > relative_gate)
        .collect();
    if gated.is_empty() {
        return (LOUDNESS_FLOOR_LUFS, 0);
    }

    let integrated = block_loudness(mean(&gated)).max(LOUDNESS_FLOOR_LUFS);
    (integrated, gated.len())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

/// Nearest-rank percentile of sorted values
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::segmentation::{SegmentationOptions, DEFAULT_MAX_FRAMES};

    fn measure(engine: &LoudnessEngine, signal: &[f32], rate: u32, max_blocks: usize) -> LoudnessRecord {
        let layout = SegmentationOptions::for_sample_rate(rate, max_blocks).loudness_layout(signal.len());
        engine.measure(signal, signal, rate, layout)
    }

    fn measure_default(signal: &[f32], rate: u32) -> LoudnessRecord {
        measure(&LoudnessEngine::default(), signal, rate, DEFAULT_MAX_FRAMES)
    }

    fn sine(freq: f64, amplitude: f64, seconds: f64, rate: u32) -> Vec<f32> {
        let n = (seconds * rate as f64) as usize;
        (0..n)
            .map(|i| (amplitude * (2.0 * PI * freq * i as f64 / rate as f64).sin()) as f32)
            .collect()
    }

    #[test]
    fn test_k_weighting_matches_48k_reference_coefficients() {
        let [shelf, high_pass] = k_weighting(48_000);
        assert!((shelf.b0 - 1.535_124_859_586_97).abs() < 1e-6);
        assert!((shelf.b1 + 2.691_696_189_406_38).abs() < 1e-6);
        assert!((shelf.b2 - 1.198_392_810_852_85).abs() < 1e-6);
        assert!((shelf.a1 + 1.690_659_293_182_41).abs() < 1e-6);
        assert!((shelf.a2 - 0.732_480_774_215_85).abs() < 1e-6);
        assert!((high_pass.a1 + 1.990_047_454_833_98).abs() < 1e-6);
        assert!((high_pass.a2 - 0.990_072_250_366_21).abs() < 1e-6);
    }

    #[test]
    fn test_silence_returns_floor() {
        let silence = vec![0.0f32; 48_000 * 3];
        let record = measure_default(&silence, 48_000);

        assert_eq!(record.integrated, LOUDNESS_FLOOR_LUFS);
        assert_eq!(record.short_term, LOUDNESS_FLOOR_LUFS);
        assert_eq!(record.momentary, LOUDNESS_FLOOR_LUFS);
        assert_eq!(record.lra, 0.0);
        assert_eq!(record.gated_blocks, 0);
        assert!(record.loudness_offset_db.is_none());
        assert!(record.integrated.is_finite());
    }

    #[test]
    fn test_too_short_for_one_block() {
        let short = vec![0.5f32; 1000];
        let record = measure_default(&short, 48_000);
        assert_eq!(record.total_blocks, 0);
        assert_eq!(record.integrated, LOUDNESS_FLOOR_LUFS);
    }

    #[test]
    fn test_1khz_sine_reads_expected_level() {
        // Stereo 1 kHz sine at -20 dBFS reads -20 LUFS: the -0.691 offset cancels the
        // K-weighting gain at 1 kHz
        let amplitude: f64 = 0.1;
        let tone = sine(1000.0, amplitude, 5.0, 48_000);
        let record = measure_default(&tone, 48_000);

        let expected = 20.0 * amplitude.log10();
        assert!(
            (record.integrated - expected).abs() < 0.2,
            "integrated {} expected {}",
            record.integrated,
            expected
        );
        assert!((record.momentary - record.integrated).abs() < 0.3);
        assert!(record.lra < 0.5);
        let offset = record.loudness_offset_db.unwrap();
        assert!((offset - (STREAMING_REFERENCE_LUFS - record.integrated)).abs() < 1e-9);
    }

    #[test]
    fn test_relative_gate_ignores_quiet_passage() {
        // 4 s loud then 4 s at -40 dB relative: quiet blocks fall below the relative gate
        let mut signal = sine(1000.0, 0.5, 4.0, 48_000);
        signal.extend(sine(1000.0, 0.005, 4.0, 48_000));
        let loud_only = sine(1000.0, 0.5, 4.0, 48_000);

        let mixed = measure_default(&signal, 48_000);
        let reference = measure_default(&loud_only, 48_000);

        assert!((mixed.integrated - reference.integrated).abs() < 0.5);
        assert!(mixed.gated_blocks < mixed.total_blocks);
    }

    #[test]
    fn test_loudness_range_of_two_levels() {
        // 10 s at one level then 10 s 6 dB lower: LRA close to 6 LU
        let mut signal = sine(1000.0, 0.4, 10.0, 48_000);
        signal.extend(sine(1000.0, 0.2, 10.0, 48_000));
        let record = measure_default(&signal, 48_000);

        assert!(
            (record.lra - 6.0).abs() < 1.0,
            "expected LRA near 6 LU, got {}",
            record.lra
        );
        assert!(record.short_term_max > record.short_term - 1e-9);
    }

    #[test]
    fn test_zero_budget_returns_partial() {
        let tone = sine(440.0, 0.5, 120.0, 48_000);
        let record = measure(&LoudnessEngine::new(Duration::ZERO), &tone, 48_000, 100_000);

        assert!(record.partial);
        assert!(record.integrated.is_finite());
        assert!(record.total_blocks < 1200 - 3);
    }

    #[test]
    fn test_block_ceiling_limits_blocks() {
        let tone = sine(440.0, 0.5, 3.0, 48_000);
        let record = measure(&LoudnessEngine::default(), &tone, 48_000, 5);
        assert_eq!(record.total_blocks, 5);
    }

    #[test]
    fn test_hop_follows_layout() {
        // 200 ms hops: 3 s gives 15 hops, 12 blocks
        let tone = sine(1000.0, 0.1, 3.0, 48_000);
        let layout = FrameLayout::compute(tone.len(), 4 * 9_600, 9_600, DEFAULT_MAX_FRAMES);
        let record = LoudnessEngine::default().measure(&tone, &tone, 48_000, layout);

        assert_eq!(record.total_blocks, layout.count);
        assert_eq!(record.total_blocks, 12);
        assert!((record.integrated + 20.0).abs() < 0.3);
    }

    #[test]
    fn test_range_gate_uses_short_term_power_mean() {
        // Half the windows at -10 LUFS, half at -31. The power mean sits near -13, so the
        // gate (-33) keeps both levels even though -31 is more than 20 LU under -10.
        let mut values = vec![-31.0; 50];
        values.extend(vec![-10.0; 50]);
        values.extend(vec![-80.0; 10]);
        assert!((loudness_range(&values) - 21.0).abs() < 1e-9);

        // A lone very quiet tail falls below the gate
        let mut values = vec![-10.0; 90];
        values.extend(vec![-40.0; 10]);
        assert_eq!(loudness_range(&values), 0.0);
    }

    #[test]
    fn test_44k1_input() {
        let tone = sine(1000.0, 0.1, 5.0, 44_100);
        let record = measure_default(&tone, 44_100);
        assert!((record.integrated + 20.0).abs() < 0.2);
    }
}
