//! Tempo estimation
//!
//! Onset-strength autocorrelation over the first 30 seconds of the mono mix:
//! frame energy in dB, positive energy rises as the onset envelope, then the
//! autocorrelation peak inside the 60–200 BPM lag range. A log-normal prior centred on
//! 120 BPM breaks ties between a tempo and its half/double.
//!
//! Returns `bpm = None` when there are too few onsets or the pick is ambiguous; a
//! guessed tempo is worse than no tempo for the scoring stage. The envelope and
//! autocorrelation loops poll a [`Deadline`] and give up with a reason once it passes.

use serde::{Deserialize, Serialize};

use super::decoder::CanonicalAudio;
use super::Deadline;

pub const ANALYSIS_SECONDS: f64 = 30.0;
pub const FRAME_SIZE: usize = 2048;
pub const HOP_SIZE: usize = 512;
pub const MIN_BPM: f64 = 60.0;
pub const MAX_BPM: f64 = 200.0;
/// Rises at least this large (dB) count as onsets
pub const ONSET_RISE_DB: f64 = 1.5;
pub const MIN_ONSETS: usize = 4;
pub const MIN_CONFIDENCE: f64 = 0.15;

const MIN_ENVELOPE_FRAMES: usize = 8;
const PRIOR_CENTER_BPM: f64 = 120.0;
const PLAUSIBLE_BPM: (f64, f64) = (30.0, 300.0);
/// Envelope frames between deadline checks
const ENVELOPE_CHECK_FRAMES: usize = 256;
/// Autocorrelation lags between deadline checks
const LAG_CHECK_INTERVAL: usize = 16;
const DEADLINE_REASON: &str = "tempo analysis exceeded its time budget";

/// The deadline passed mid-loop
#[derive(Debug, Clone, Copy)]
struct Expired;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoRecord {
    pub bpm: Option<f64>,
    pub confidence: f64,
    pub onsets_detected: usize,
    pub analyzed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TempoRecord {
    fn undetermined(reason: impl Into<String>, onsets: usize, seconds: f64, confidence: f64) -> Self {
        Self {
            bpm: None,
            confidence,
            onsets_detected: onsets,
            analyzed_seconds: seconds,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TempoEngine;

impl TempoEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn measure(&self, audio: &CanonicalAudio) -> TempoRecord {
        self.measure_within(audio, Deadline::unbounded())
    }

    pub fn measure_within(&self, audio: &CanonicalAudio, deadline: Deadline) -> TempoRecord {
        let rate = audio.sample_rate() as f64;
        let mut mono = audio.mono_mix();
        mono.truncate((ANALYSIS_SECONDS * rate) as usize);
        let seconds = mono.len() as f64 / rate;

        let envelope = match onset_envelope(&mono, deadline) {
            Ok(envelope) => envelope,
            Err(Expired) => return TempoRecord::undetermined(DEADLINE_REASON, 0, seconds, 0.0),
        };
        if envelope.len() < MIN_ENVELOPE_FRAMES {
            return TempoRecord::undetermined("signal too short for tempo analysis", 0, seconds, 0.0);
        }

        let onsets = envelope.iter().filter(|r| **r >= ONSET_RISE_DB).count();
        if onsets < MIN_ONSETS {
            return TempoRecord::undetermined("not enough onsets", onsets, seconds, 0.0);
        }

        let frame_rate = rate / HOP_SIZE as f64;
        let min_lag = ((60.0 * frame_rate / MAX_BPM).floor() as usize).max(1);
        let max_lag = ((60.0 * frame_rate / MIN_BPM).ceil() as usize).min(envelope.len() / 2);
        if min_lag + 2 > max_lag {
            return TempoRecord::undetermined("signal too short for tempo analysis", onsets, seconds, 0.0);
        }

        let correlation = match autocorrelation(&envelope, max_lag + 1, deadline) {
            Ok(Some(r)) => r,
            Ok(None) => return TempoRecord::undetermined("flat onset envelope", onsets, seconds, 0.0),
            Err(Expired) => {
                return TempoRecord::undetermined(DEADLINE_REASON, onsets, seconds, 0.0)
            }
        };

        let lag_bpm = |lag: f64| 60.0 * frame_rate / lag;
        let mut best: Option<(usize, f64)> = None;
        for lag in min_lag..=max_lag {
            let weighted = correlation[lag] * prior(lag_bpm(lag as f64));
            if best.map_or(true, |(_, w)| weighted > w) {
                best = Some((lag, weighted));
            }
        }
        let best_lag = match best {
            Some((lag, _)) if correlation[lag] > 0.0 => lag,
            _ => return TempoRecord::undetermined("no periodicity found", onsets, seconds, 0.0),
        };
        let best_r = correlation[best_lag];

        let second_r = (min_lag..=max_lag)
            .filter(|lag| lag.abs_diff(best_lag) > 2)
            .map(|lag| correlation[lag])
            .fold(f64::NEG_INFINITY, f64::max)
            .max(0.0);

        let refined_lag = best_lag as f64 + parabolic_offset(&correlation, best_lag);
        let bpm = lag_bpm(refined_lag);

        let mut confidence = (0.6 * (best_r - second_r) + 0.4 * best_r.max(0.0)).clamp(0.0, 1.0);
        if bpm < PLAUSIBLE_BPM.0 || bpm > PLAUSIBLE_BPM.1 {
            confidence *= 0.5;
        }
        if confidence < MIN_CONFIDENCE {
            return TempoRecord::undetermined("ambiguous periodicity", onsets, seconds, confidence);
        }

        TempoRecord {
            bpm: Some((bpm * 10.0).round() / 10.0),
            confidence,
            onsets_detected: onsets,
            analyzed_seconds: seconds,
            reason: None,
        }
    }
}

/// Positive frame-to-frame energy rises in dB
fn onset_envelope(mono: &[f32], deadline: Deadline) -> Result<Vec<f64>, Expired> {
    if mono.len() < FRAME_SIZE {
        return Ok(Vec::new());
    }
    let frames = (mono.len() - FRAME_SIZE) / HOP_SIZE + 1;
    let mut energy_db: Vec<f64> = Vec::with_capacity(frames);
    for i in 0..frames {
        if i > 0 && i % ENVELOPE_CHECK_FRAMES == 0 && deadline.expired() {
            return Err(Expired);
        }
        let start = i * HOP_SIZE;
        let mean_square = mono[start..start + FRAME_SIZE]
            .iter()
            .map(|s| (*s as f64) * (*s as f64))
            .sum::<f64>()
            / FRAME_SIZE as f64;
        energy_db.push(10.0 * (mean_square + 1e-10).log10());
    }

    Ok(energy_db
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).max(0.0))
        .collect())
}

/// Mean-centred autocorrelation normalised by lag-zero energy; `None` for a flat envelope
fn autocorrelation(
    envelope: &[f64],
    lags: usize,
    deadline: Deadline,
) -> Result<Option<Vec<f64>>, Expired> {
    let mean = envelope.iter().sum::<f64>() / envelope.len() as f64;
    let centred: Vec<f64> = envelope.iter().map(|x| x - mean).collect();
    let energy: f64 = centred.iter().map(|x| x * x).sum();
    if energy <= 1e-12 {
        return Ok(None);
    }

    let mut correlation = Vec::with_capacity(lags);
    for lag in 0..lags {
        if lag > 0 && lag % LAG_CHECK_INTERVAL == 0 && deadline.expired() {
            return Err(Expired);
        }
        let r = centred
            .iter()
            .zip(centred.iter().skip(lag))
            .map(|(a, b)| a * b)
            .sum::<f64>()
            / energy;
        correlation.push(r);
    }
    Ok(Some(correlation))
}

fn prior(bpm: f64) -> f64 {
    let octaves = (bpm / PRIOR_CENTER_BPM).log2();
    (-0.5 * octaves * octaves).exp()
}

fn parabolic_offset(values: &[f64], index: usize) -> f64 {
    if index == 0 || index + 1 >= values.len() {
        return 0.0;
    }
    let (a, b, c) = (values[index - 1], values[index], values[index + 1]);
    let denom = a - 2.0 * b + c;
    if denom.abs() < 1e-12 {
        0.0
    } else {
        (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;
    use std::time::Duration;

    fn audio(mono: Vec<f32>) -> CanonicalAudio {
        CanonicalAudio::new(mono.clone(), mono, 48_000, 2).unwrap()
    }

    fn click_track(bpm: f64, seconds: f64) -> Vec<f32> {
        let rate = 48_000.0;
        let mut samples = vec![0.0f32; (seconds * rate) as usize];
        let period = 60.0 / bpm * rate;
        let burst = (0.010 * rate) as usize;
        let mut beat = 0.0;
        while (beat as usize) < samples.len() {
            let start = beat as usize;
            for (i, s) in samples.iter_mut().skip(start).take(burst).enumerate() {
                *s = (0.8 * (2.0 * PI * 1_000.0 * i as f64 / rate).sin()) as f32;
            }
            beat += period;
        }
        samples
    }

    #[test]
    fn test_click_track_at_120_bpm() {
        let record = TempoEngine::new().measure(&audio(click_track(120.0, 12.0)));

        let bpm = record.bpm.expect("tempo should be detected");
        assert!((bpm - 120.0).abs() <= 3.0, "bpm {}", bpm);
        assert!(record.confidence >= MIN_CONFIDENCE);
        assert!(record.onsets_detected >= MIN_ONSETS);
    }

    #[test]
    fn test_click_track_at_90_bpm() {
        let record = TempoEngine::new().measure(&audio(click_track(90.0, 15.0)));
        let bpm = record.bpm.expect("tempo should be detected");
        assert!((bpm - 90.0).abs() <= 3.0, "bpm {}", bpm);
    }

    #[test]
    fn test_steady_sine_has_no_tempo() {
        let tone: Vec<f32> = (0..96_000)
            .map(|i| (0.5 * (2.0 * PI * 440.0 * i as f64 / 48_000.0).sin()) as f32)
            .collect();
        let record = TempoEngine::new().measure(&audio(tone));

        assert!(record.bpm.is_none());
        assert!(record.reason.is_some());
    }

    #[test]
    fn test_short_signal_has_no_tempo() {
        let record = TempoEngine::new().measure(&audio(vec![0.1; 1000]));
        assert!(record.bpm.is_none());
        assert_eq!(record.onsets_detected, 0);
    }

    #[test]
    fn test_analysis_window_is_capped() {
        let record = TempoEngine::new().measure(&audio(click_track(120.0, 40.0)));
        assert!((record.analyzed_seconds - ANALYSIS_SECONDS).abs() < 1e-6);
    }

    #[test]
    fn test_expired_deadline_stops_early_with_reason() {
        let clicks = audio(click_track(120.0, 12.0));
        let record = TempoEngine::new().measure_within(&clicks, Deadline::after(Duration::ZERO));

        assert!(record.bpm.is_none());
        assert_eq!(record.reason.as_deref(), Some(DEADLINE_REASON));
        // The same input still resolves without a limit
        assert!(TempoEngine::new().measure(&clicks).bpm.is_some());
    }

    #[test]
    fn test_prior_prefers_120() {
        assert!((prior(120.0) - 1.0).abs() < 1e-12);
        assert!(prior(60.0) < prior(90.0));
        assert!((prior(60.0) - prior(240.0)).abs() < 1e-12);
    }
}
