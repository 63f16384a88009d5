//! Sample rate conversion for the in-process decoder
//!
//! Converts planar channels to the canonical analysis rate using rubato's
//! polynomial resampler.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

/// Resample planar channels from `input_rate` to `output_rate`.
///
/// All channels must have the same length. Returns the input unchanged when the
/// rates already match.
pub fn resample_planar(
    channels: Vec<Vec<f32>>,
    input_rate: u32,
    output_rate: u32,
) -> Result<Vec<Vec<f32>>, String> {
    if input_rate == output_rate || channels.is_empty() {
        return Ok(channels);
    }

    let input_frames = channels[0].len();
    if input_frames == 0 {
        return Ok(channels);
    }
    if channels.iter().any(|c| c.len() != input_frames) {
        return Err("channel lengths differ".to_string());
    }

    debug!(
        input_rate,
        output_rate,
        channels = channels.len(),
        input_frames,
        "Resampling decoded audio"
    );

    // One chunk covering the whole signal
    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        input_frames,
        channels.len(),
    )
    .map_err(|e| format!("Failed to create resampler: {}", e))?;

    let output = resampler
        .process(&channels, None)
        .map_err(|e| format!("Resampling failed: {}", e))?;

    debug!(
        output_frames = output.first().map(|c| c.len()).unwrap_or(0),
        "Resampling complete"
    );

    Ok(output)
}

/// Split interleaved samples into one vector per channel.
///
/// Input:  [L, R, L, R, ...]
/// Output: [[L, L, ...], [R, R, ...]]
pub fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    if channels == 0 {
        return Vec::new();
    }
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];

    for frame in samples.chunks_exact(channels) {
        for (ch, sample) in frame.iter().enumerate() {
            planar[ch].push(*sample);
        }
    }

    planar
}
