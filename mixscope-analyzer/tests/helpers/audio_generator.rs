//! Audio Test Fixture Generator
//!
//! Writes sine WAV files with hound for decoder and pipeline tests

use std::path::{Path, PathBuf};

/// Configuration for a generated sine
#[derive(Debug, Clone)]
pub struct SineConfig {
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub frequency_hz: f32,
    /// Linear peak amplitude, 0.0..=1.0
    pub amplitude: f32,
}

impl Default for SineConfig {
    fn default() -> Self {
        Self {
            duration_seconds: 2.0,
            sample_rate: 48_000,
            channels: 2,
            frequency_hz: 440.0,
            amplitude: 0.5,
        }
    }
}

/// In-memory sine of `frames` samples
pub fn sine(frames: usize, sample_rate: u32, frequency_hz: f32, amplitude: f32) -> Vec<f32> {
    (0..frames)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency_hz * t).sin()
        })
        .collect()
}

/// Generate a 32-bit float WAV containing the same sine on every channel
pub fn generate_sine_wav(path: &Path, config: &SineConfig) -> anyhow::Result<PathBuf> {
    let spec = hound::WavSpec {
        channels: config.channels,
        sample_rate: config.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    let total_frames = (config.duration_seconds * config.sample_rate as f64) as usize;

    for sample in sine(total_frames, config.sample_rate, config.frequency_hz, config.amplitude) {
        for _ in 0..config.channels {
            writer.write_sample(sample)?;
        }
    }

    writer.finalize()?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_sine_wav() {
        let temp_dir = TempDir::new().unwrap();
        let wav_path = temp_dir.path().join("tone.wav");

        generate_sine_wav(&wav_path, &SineConfig::default()).unwrap();

        let reader = hound::WavReader::open(&wav_path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 48_000);
        assert_eq!(reader.duration(), 96_000);
    }
}
