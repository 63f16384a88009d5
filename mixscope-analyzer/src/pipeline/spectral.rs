//! Spectral (FFT) engine
//!
//! **Algorithm:**
//! 1. FFT every Hann-windowed frame of both channels
//! 2. Combine channels per bin as mean power `(|L|² + |R|²) / 2`
//! 3. Average power across frames for band energies and dominant peaks
//! 4. Per-frame descriptors, aggregated by median across non-silent frames
//!
//! Band energy is reported as mean-square dBFS (`10·log10(2·E / (N·Σw²))`, so a full-scale
//! sine reads -3 dB) and as a percentage of the energy in 20 Hz–20 kHz. Percentages sum
//! to 100.
//!
//! Each band is also split into finer sub-bands whose level is the median of per-frame
//! levels, and the spread of per-bin band densities gives a spectral uniformity rating.
//!
//! Without frames, or without energy, the record carries `status = not_calculated` and a
//! reason instead of empty fields. The same happens when the [`Deadline`] passes mid-run.

use rustfft::num_complex::Complex32;
use rustfft::Fft;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::fft::FftCache;
use super::segmentation::SegmentedAudio;
use super::Deadline;

/// Energy below this is treated as silence
pub const MIN_ENERGY: f64 = 1e-12;
pub const ROLLOFF_FRACTION: f64 = 0.85;
pub const BAND_FLOOR_DB: f64 = -120.0;

const DOMINANT_MIN_HZ: f64 = 20.0;
const DOMINANT_MAX_HZ: f64 = 20_000.0;
const DOMINANT_MIN_SEPARATION_HZ: f64 = 50.0;
const MAX_DOMINANT_FREQUENCIES: usize = 10;
/// Peaks weaker than this relative to the strongest are ignored
const DOMINANT_FLOOR_DB: f64 = -60.0;
/// Frames between deadline checks
const DEADLINE_CHECK_FRAMES: usize = 32;

/// Bands further than this below the densest one are left out of uniformity
const UNIFORMITY_SPAN_DB: f64 = 60.0;
/// Upper bounds on the density standard deviation (dB) per rating
const UNIFORMITY_EXCELLENT_DB: f64 = 4.5;
const UNIFORMITY_GOOD_DB: f64 = 7.5;
const UNIFORMITY_FAIR_DB: f64 = 12.0;

/// Sub-band split: `(id, parent band, low Hz, high Hz)`. Edges tile each parent band.
pub const SUB_BANDS: [(&str, Band, f64, f64); 13] = [
    ("sub_low", Band::Sub, 20.0, 40.0),
    ("sub_high", Band::Sub, 40.0, 60.0),
    ("bass_low", Band::Bass, 60.0, 90.0),
    ("bass_mid", Band::Bass, 90.0, 120.0),
    ("bass_high", Band::Bass, 120.0, 150.0),
    ("low_mid_low", Band::LowMid, 150.0, 300.0),
    ("low_mid_high", Band::LowMid, 300.0, 500.0),
    ("mid_low", Band::Mid, 500.0, 1_000.0),
    ("mid_high", Band::Mid, 1_000.0, 2_000.0),
    ("high_mid_low", Band::HighMid, 2_000.0, 3_500.0),
    ("high_mid_high", Band::HighMid, 3_500.0, 5_000.0),
    ("presence", Band::Presence, 5_000.0, 10_000.0),
    ("air", Band::Air, 10_000.0, 20_000.0),
];

/// Named analysis bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Sub,
    Bass,
    LowMid,
    Mid,
    HighMid,
    Presence,
    Air,
}

impl Band {
    pub const ALL: [Band; 7] = [
        Band::Sub,
        Band::Bass,
        Band::LowMid,
        Band::Mid,
        Band::HighMid,
        Band::Presence,
        Band::Air,
    ];

    /// Half-open frequency range `[low, high)` in Hz
    pub fn range_hz(self) -> (f64, f64) {
        match self {
            Band::Sub => (20.0, 60.0),
            Band::Bass => (60.0, 150.0),
            Band::LowMid => (150.0, 500.0),
            Band::Mid => (500.0, 2_000.0),
            Band::HighMid => (2_000.0, 5_000.0),
            Band::Presence => (5_000.0, 10_000.0),
            Band::Air => (10_000.0, 20_000.0),
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Band::Sub => "sub",
            Band::Bass => "bass",
            Band::LowMid => "low_mid",
            Band::Mid => "mid",
            Band::HighMid => "high_mid",
            Band::Presence => "presence",
            Band::Air => "air",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Band::Sub => "Sub",
            Band::Bass => "Bass",
            Band::LowMid => "Low-mid",
            Band::Mid => "Mid",
            Band::HighMid => "High-mid",
            Band::Presence => "Presence",
            Band::Air => "Air",
        }
    }

    pub fn from_key(key: &str) -> Option<Band> {
        Band::ALL.into_iter().find(|b| b.key() == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectralStatus {
    Calculated,
    NotCalculated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandEnergy {
    pub band: Band,
    pub energy_db: f64,
    pub percentage: f64,
}

/// Level of one sub-band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubBandEnergy {
    pub id: String,
    pub band: Band,
    pub low_hz: f64,
    pub high_hz: f64,
    /// Median over non-silent frames of the per-frame mean-square level (dBFS)
    pub energy_db: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniformityRating {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Spread of per-bin power density across the named bands. A flat (white) spectrum has
/// zero spread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralUniformity {
    pub std_dev_db: f64,
    pub range_db: f64,
    pub mean_deviation_db: f64,
    pub rating: UniformityRating,
    pub densest_band: Band,
    pub weakest_band: Band,
    /// Mean density of presence and air minus that of sub and bass
    pub tilt_db: f64,
}

/// Median of per-frame descriptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralDescriptors {
    pub centroid_hz: f64,
    pub rolloff_hz: f64,
    /// Spectral spread (bandwidth) around the centroid
    pub spread_hz: f64,
    /// Geometric over arithmetic mean power, 0 (tonal) to 1 (noise)
    pub flatness: f64,
    /// Peak over mean magnitude
    pub crest: f64,
    pub skewness: f64,
    pub kurtosis: f64,
    /// Sign changes per sample
    pub zero_crossing_rate: f64,
    /// Positive change of the normalized magnitude spectrum between frames
    pub flux: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominantFrequency {
    pub frequency_hz: f64,
    /// Relative to the strongest peak (0 dB)
    pub magnitude_db: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralRecord {
    pub status: SpectralStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub frames_analyzed: usize,
    pub fft_size: usize,
    pub bands: Vec<BandEnergy>,
    pub sub_bands: Vec<SubBandEnergy>,
    pub uniformity: Option<SpectralUniformity>,
    pub descriptors: Option<SpectralDescriptors>,
    pub dominant_frequencies: Vec<DominantFrequency>,
}

impl SpectralRecord {
    pub fn not_calculated(reason: impl Into<String>, frames_analyzed: usize, fft_size: usize) -> Self {
        Self {
            status: SpectralStatus::NotCalculated,
            reason: Some(reason.into()),
            frames_analyzed,
            fft_size,
            bands: Vec::new(),
            sub_bands: Vec::new(),
            uniformity: None,
            descriptors: None,
            dominant_frequencies: Vec::new(),
        }
    }

    pub fn is_calculated(&self) -> bool {
        self.status == SpectralStatus::Calculated
    }

    pub fn band(&self, band: Band) -> Option<&BandEnergy> {
        self.bands.iter().find(|b| b.band == band)
    }
}

/// Descriptors of a single frame
#[derive(Debug, Clone, Copy)]
struct FrameDescriptors {
    centroid: f64,
    rolloff: f64,
    spread: f64,
    flatness: f64,
    crest: f64,
    skewness: f64,
    kurtosis: f64,
}

/// Spectral engine; owns its FFT plan cache
#[derive(Debug, Default)]
pub struct SpectralEngine {
    cache: FftCache,
}

impl SpectralEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &FftCache {
        &self.cache
    }

    pub fn measure(&self, segmented: &SegmentedAudio) -> SpectralRecord {
        self.measure_within(segmented, Deadline::unbounded())
    }

    pub fn measure_within(&self, segmented: &SegmentedAudio, deadline: Deadline) -> SpectralRecord {
        let layout = segmented.fft_layout();
        let n = layout.size;
        if layout.count == 0 || n < 4 {
            return SpectralRecord::not_calculated(
                "no FFT frames: signal shorter than one analysis frame",
                0,
                n,
            );
        }

        let half = n / 2;
        let resolution = segmented.sample_rate() as f64 / n as f64;
        let fft = self.cache.forward(n);
        let mut scratch = vec![Complex32::default(); fft.get_inplace_scratch_len()];
        let mut buf_l = vec![Complex32::default(); n];
        let mut buf_r = vec![Complex32::default(); n];

        let window_energy: f64 = segmented
            .window()
            .iter()
            .map(|w| (*w as f64) * (*w as f64))
            .sum();
        // Summed bin power to mean-square signal power
        let scale = 2.0 / (n as f64 * window_energy);

        let sub_bins: Vec<std::ops::Range<usize>> = SUB_BANDS
            .iter()
            .map(|&(_, _, lo, hi)| bin_range(lo, hi, resolution, half))
            .collect();
        let mut sub_levels: Vec<Vec<f64>> = vec![Vec::with_capacity(layout.count); SUB_BANDS.len()];

        let mut avg_power = vec![0.0f64; half + 1];
        let mut power = vec![0.0f64; half + 1];
        let mut prev_normalized: Option<Vec<f64>> = None;

        let mut per_frame: Vec<FrameDescriptors> = Vec::with_capacity(layout.count);
        let mut zcr: Vec<f64> = Vec::with_capacity(layout.count);
        let mut flux: Vec<f64> = Vec::with_capacity(layout.count);
        let mut frames = 0usize;

        for frame in segmented.fft_frames() {
            if frames > 0 && frames % DEADLINE_CHECK_FRAMES == 0 && deadline.expired() {
                warn!(
                    frames_analyzed = frames,
                    frames_total = layout.count,
                    "Spectral analysis passed its deadline, stopping"
                );
                return SpectralRecord::not_calculated(
                    format!("spectral analysis exceeded its time budget after {} frames", frames),
                    frames,
                    n,
                );
            }
            frames += 1;
            zcr.push(zero_crossing_rate(&frame.left, &frame.right));

            for (dst, &s) in buf_l.iter_mut().zip(frame.left.iter()) {
                *dst = Complex32::new(s, 0.0);
            }
            for (dst, &s) in buf_r.iter_mut().zip(frame.right.iter()) {
                *dst = Complex32::new(s, 0.0);
            }
            fft.process_with_scratch(&mut buf_l, &mut scratch);
            fft.process_with_scratch(&mut buf_r, &mut scratch);

            for k in 0..=half {
                let p = 0.5 * (buf_l[k].norm_sqr() as f64 + buf_r[k].norm_sqr() as f64);
                power[k] = p;
                avg_power[k] += p;
            }

            let frame_energy: f64 = power[1..].iter().sum();
            if frame_energy < MIN_ENERGY {
                prev_normalized = None;
                continue;
            }

            for (levels, bins) in sub_levels.iter_mut().zip(&sub_bins) {
                let mean_square = power[bins.clone()].iter().sum::<f64>() * scale;
                if mean_square > 0.0 {
                    levels.push(10.0 * mean_square.log10());
                }
            }

            if let Some(d) = frame_descriptors(&power, resolution) {
                per_frame.push(d);
            }

            let magnitude_sum: f64 = power[1..].iter().map(|p| p.sqrt()).sum();
            let normalized: Vec<f64> = power[1..]
                .iter()
                .map(|p| p.sqrt() / magnitude_sum)
                .collect();
            if let Some(prev) = &prev_normalized {
                let positive: f64 = normalized
                    .iter()
                    .zip(prev.iter())
                    .map(|(now, before)| (now - before).max(0.0))
                    .sum();
                flux.push(positive);
            }
            prev_normalized = Some(normalized);
        }

        if frames == 0 {
            return SpectralRecord::not_calculated("no FFT frames delivered", 0, n);
        }
        for p in &mut avg_power {
            *p /= frames as f64;
        }

        let bands = match band_energies(&avg_power, resolution, scale) {
            Some(bands) => bands,
            None => {
                return SpectralRecord::not_calculated(
                    "no spectral energy between 20 Hz and 20 kHz",
                    frames,
                    n,
                )
            }
        };

        let sub_bands = SUB_BANDS
            .iter()
            .zip(sub_levels.iter_mut())
            .map(|(&(id, band, low_hz, high_hz), levels)| SubBandEnergy {
                id: id.to_string(),
                band,
                low_hz,
                high_hz,
                energy_db: median(levels).map_or(BAND_FLOOR_DB, |db| db.max(BAND_FLOOR_DB)),
            })
            .collect();

        let densities: Vec<(Band, f64)> = Band::ALL
            .iter()
            .map(|&band| {
                let (lo, hi) = band.range_hz();
                let bins = bin_range(lo, hi, resolution, half);
                let count = bins.len().max(1) as f64;
                let mean_square = avg_power[bins].iter().sum::<f64>() * scale / count;
                (band, to_db_floored(mean_square))
            })
            .collect();
        let uniformity = spectral_uniformity(&densities);

        let descriptors = aggregate_descriptors(&per_frame, &mut zcr, &mut flux);
        let dominant_frequencies = dominant_frequencies(&avg_power, resolution);

        SpectralRecord {
            status: SpectralStatus::Calculated,
            reason: None,
            frames_analyzed: frames,
            fft_size: n,
            bands,
            sub_bands,
            uniformity,
            descriptors,
            dominant_frequencies,
        }
    }
}

/// Bins whose centre frequency lies in `[lo, hi)`, DC excluded
fn bin_range(lo: f64, hi: f64, resolution: f64, half: usize) -> std::ops::Range<usize> {
    let start = ((lo / resolution).ceil() as usize).max(1);
    let end = ((hi / resolution).ceil() as usize).min(half + 1);
    start..end.max(start)
}

fn to_db_floored(mean_square: f64) -> f64 {
    if mean_square > 0.0 {
        (10.0 * mean_square.log10()).max(BAND_FLOOR_DB)
    } else {
        BAND_FLOOR_DB
    }
}

/// Uniformity of per-bin band densities (dB). `None` with fewer than three bands within
/// [`UNIFORMITY_SPAN_DB`] of the densest.
pub fn spectral_uniformity(densities: &[(Band, f64)]) -> Option<SpectralUniformity> {
    let &(densest_band, densest) = densities.iter().max_by(|a, b| a.1.total_cmp(&b.1))?;
    let active: Vec<(Band, f64)> = densities
        .iter()
        .copied()
        .filter(|(_, db)| *db > densest - UNIFORMITY_SPAN_DB)
        .collect();
    if active.len() < 3 {
        return None;
    }

    let count = active.len() as f64;
    let mean = active.iter().map(|(_, db)| db).sum::<f64>() / count;
    let std_dev_db = (active.iter().map(|(_, db)| (db - mean).powi(2)).sum::<f64>() / count).sqrt();
    let mean_deviation_db = active.iter().map(|(_, db)| (db - mean).abs()).sum::<f64>() / count;
    let (weakest_band, weakest) = active
        .iter()
        .copied()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((densest_band, densest));

    let level = |band: Band| {
        densities
            .iter()
            .find(|(b, _)| *b == band)
            .map_or(BAND_FLOOR_DB, |(_, db)| *db)
    };
    let tilt_db = 0.5 * (level(Band::Presence) + level(Band::Air))
        - 0.5 * (level(Band::Sub) + level(Band::Bass));

    let rating = match std_dev_db {
        d if d <= UNIFORMITY_EXCELLENT_DB => UniformityRating::Excellent,
        d if d <= UNIFORMITY_GOOD_DB => UniformityRating::Good,
        d if d <= UNIFORMITY_FAIR_DB => UniformityRating::Fair,
        _ => UniformityRating::Poor,
    };

    Some(SpectralUniformity {
        std_dev_db,
        range_db: densest - weakest,
        mean_deviation_db,
        rating,
        densest_band,
        weakest_band,
        tilt_db,
    })
}

fn band_energies(avg_power: &[f64], resolution: f64, scale: f64) -> Option<Vec<BandEnergy>> {
    let half = avg_power.len().saturating_sub(1);
    let energies: Vec<(Band, f64)> = Band::ALL
        .iter()
        .map(|&band| {
            let (lo, hi) = band.range_hz();
            (band, avg_power[bin_range(lo, hi, resolution, half)].iter().sum())
        })
        .collect();

    let total: f64 = energies.iter().map(|(_, e)| e).sum();
    if total < MIN_ENERGY || !total.is_finite() {
        return None;
    }

    Some(
        energies
            .into_iter()
            .map(|(band, energy)| BandEnergy {
                band,
                energy_db: to_db_floored(energy * scale),
                percentage: 100.0 * energy / total,
            })
            .collect(),
    )
}

/// Magnitude-weighted moments of one frame, DC excluded
fn frame_descriptors(power: &[f64], resolution: f64) -> Option<FrameDescriptors> {
    let bins = &power[1..];
    let magnitudes: Vec<f64> = bins.iter().map(|p| p.sqrt()).collect();
    let mag_sum: f64 = magnitudes.iter().sum();
    let power_sum: f64 = bins.iter().sum();
    if mag_sum <= 0.0 || power_sum <= 0.0 {
        return None;
    }
    let freq = |i: usize| (i + 1) as f64 * resolution;

    let centroid = magnitudes
        .iter()
        .enumerate()
        .map(|(i, m)| freq(i) * m)
        .sum::<f64>()
        / mag_sum;

    let moment = |order: i32| -> f64 {
        magnitudes
            .iter()
            .enumerate()
            .map(|(i, m)| (freq(i) - centroid).powi(order) * m)
            .sum::<f64>()
            / mag_sum
    };
    let variance = moment(2);
    let spread = variance.sqrt();
    let (skewness, kurtosis) = if spread > 1e-9 {
        (moment(3) / spread.powi(3), moment(4) / variance.powi(2))
    } else {
        (0.0, 0.0)
    };

    let threshold = ROLLOFF_FRACTION * power_sum;
    let mut cumulative = 0.0;
    let mut rolloff = freq(bins.len() - 1);
    for (i, p) in bins.iter().enumerate() {
        cumulative += p;
        if cumulative >= threshold {
            rolloff = freq(i);
            break;
        }
    }

    let count = bins.len() as f64;
    let log_mean = bins.iter().map(|p| (p + MIN_ENERGY).ln()).sum::<f64>() / count;
    let flatness = (log_mean.exp() / (power_sum / count + MIN_ENERGY)).clamp(0.0, 1.0);

    let max_mag = magnitudes.iter().copied().fold(0.0, f64::max);
    let crest = max_mag / (mag_sum / count);

    Some(FrameDescriptors {
        centroid,
        rolloff,
        spread,
        flatness,
        crest,
        skewness,
        kurtosis,
    })
}

fn aggregate_descriptors(
    per_frame: &[FrameDescriptors],
    zcr: &mut [f64],
    flux: &mut [f64],
) -> Option<SpectralDescriptors> {
    if per_frame.is_empty() {
        return None;
    }
    let med = |f: fn(&FrameDescriptors) -> f64| {
        let mut values: Vec<f64> = per_frame.iter().map(f).collect();
        median(&mut values).unwrap_or(0.0)
    };

    Some(SpectralDescriptors {
        centroid_hz: med(|d| d.centroid),
        rolloff_hz: med(|d| d.rolloff),
        spread_hz: med(|d| d.spread),
        flatness: med(|d| d.flatness),
        crest: med(|d| d.crest),
        skewness: med(|d| d.skewness),
        kurtosis: med(|d| d.kurtosis),
        zero_crossing_rate: median(zcr).unwrap_or(0.0),
        flux: median(flux).unwrap_or(0.0),
    })
}

fn zero_crossing_rate(left: &[f32], right: &[f32]) -> f64 {
    if left.len() < 2 {
        return 0.0;
    }
    let mut crossings = 0usize;
    let mut prev = 0.5 * (left[0] + right[0]);
    for (l, r) in left.iter().zip(right.iter()).skip(1) {
        let x = 0.5 * (l + r);
        if prev * x < 0.0 {
            crossings += 1;
        }
        prev = x;
    }
    crossings as f64 / (left.len() - 1) as f64
}

/// Local maxima of the averaged magnitude spectrum, strongest first, at least
/// `DOMINANT_MIN_SEPARATION_HZ` apart
fn dominant_frequencies(avg_power: &[f64], resolution: f64) -> Vec<DominantFrequency> {
    let magnitudes: Vec<f64> = avg_power.iter().map(|p| p.sqrt()).collect();
    let lo = ((DOMINANT_MIN_HZ / resolution).floor() as usize).max(1);
    let hi = ((DOMINANT_MAX_HZ / resolution).ceil() as usize).min(magnitudes.len().saturating_sub(2));

    let mut peaks: Vec<(f64, f64)> = Vec::new();
    for k in lo..=hi {
        let (a, b, c) = (magnitudes[k - 1], magnitudes[k], magnitudes[k + 1]);
        if b > a && b >= c && b > 0.0 {
            // Parabolic interpolation on log magnitude
            let (la, lb, lc) = (
                (a + MIN_ENERGY).ln(),
                (b + MIN_ENERGY).ln(),
                (c + MIN_ENERGY).ln(),
            );
            let denom = la - 2.0 * lb + lc;
            let offset = if denom.abs() > 1e-12 {
                (0.5 * (la - lc) / denom).clamp(-0.5, 0.5)
            } else {
                0.0
            };
            peaks.push(((k as f64 + offset) * resolution, b));
        }
    }

    peaks.sort_by(|x, y| y.1.total_cmp(&x.1));
    let strongest = match peaks.first() {
        Some(&(_, m)) => m,
        None => return Vec::new(),
    };

    let mut selected: Vec<DominantFrequency> = Vec::new();
    for (frequency_hz, magnitude) in peaks {
        if selected.len() >= MAX_DOMINANT_FREQUENCIES {
            break;
        }
        let magnitude_db = 20.0 * (magnitude / strongest).log10();
        if magnitude_db < DOMINANT_FLOOR_DB {
            break;
        }
        if selected
            .iter()
            .all(|s| (s.frequency_hz - frequency_hz).abs() >= DOMINANT_MIN_SEPARATION_HZ)
        {
            selected.push(DominantFrequency {
                frequency_hz,
                magnitude_db,
            });
        }
    }
    selected
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    })
}
