//! Decoder adapter
//!
//! Turns an input file into [`CanonicalAudio`]: planar stereo f32 at 48 kHz.
//!
//! Two implementations sit behind the [`Decoder`] trait:
//! - [`FfmpegDecoder`] runs the external transcoding tool and reads raw `f32le` PCM
//!   from its stdout. A non-zero exit becomes [`DecodeError::Collaborator`] carrying the
//!   tool's stderr.
//! - [`SymphoniaDecoder`] decodes in-process (symphonia + rubato). It is used when the tool
//!   is not installed and in tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, warn};

use crate::utils::resampler::{deinterleave, resample_planar};

/// Canonical analysis sample rate
pub const TARGET_SAMPLE_RATE: u32 = 48_000;

/// Canonical channel count
pub const TARGET_CHANNELS: usize = 2;

/// Longest stderr excerpt kept in a collaborator diagnostic
const MAX_DIAGNOSTIC_CHARS: usize = 2000;

/// Decoding failure
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot read input: {0}")]
    Io(#[from] std::io::Error),

    /// The external tool exited non-zero
    #[error("decoder exited with status {status:?}: {diagnostic}")]
    Collaborator {
        status: Option<i32>,
        diagnostic: String,
    },

    #[error("unsupported or corrupt input: {0}")]
    Unsupported(String),

    #[error("decoded stream contains no samples")]
    Empty,

    #[error("non-finite sample at frame {frame}")]
    NonFinite { frame: usize },

    #[error("channel length mismatch (left {left}, right {right})")]
    LengthMismatch { left: usize, right: usize },

    #[error("decode exceeded {secs}s")]
    Timeout { secs: u64 },

    #[error("decoder task failed: {0}")]
    Internal(String),
}

/// Decoded signal owned by a single pipeline run
///
/// Both channels always have the same, non-zero length and every sample is finite.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalAudio {
    left: Vec<f32>,
    right: Vec<f32>,
    sample_rate: u32,
    source_channels: usize,
}

impl CanonicalAudio {
    pub fn new(
        left: Vec<f32>,
        right: Vec<f32>,
        sample_rate: u32,
        source_channels: usize,
    ) -> Result<Self, DecodeError> {
        if left.len() != right.len() {
            return Err(DecodeError::LengthMismatch {
                left: left.len(),
                right: right.len(),
            });
        }
        if left.is_empty() {
            return Err(DecodeError::Empty);
        }
        if sample_rate == 0 {
            return Err(DecodeError::Unsupported("sample rate is zero".to_string()));
        }
        if let Some(frame) = left
            .iter()
            .zip(right.iter())
            .position(|(l, r)| !l.is_finite() || !r.is_finite())
        {
            return Err(DecodeError::NonFinite { frame });
        }

        Ok(Self {
            left,
            right,
            sample_rate,
            source_channels,
        })
    }

    /// Build from interleaved samples. Mono is duplicated to both channels and
    /// channels beyond the first two are dropped.
    pub fn from_interleaved(
        samples: &[f32],
        channels: usize,
        sample_rate: u32,
    ) -> Result<Self, DecodeError> {
        if channels == 0 {
            return Err(DecodeError::Unsupported("zero channels".to_string()));
        }
        Self::from_planar(deinterleave(samples, channels), channels, sample_rate)
    }

    fn from_planar(
        planar: Vec<Vec<f32>>,
        source_channels: usize,
        sample_rate: u32,
    ) -> Result<Self, DecodeError> {
        let mut channels = planar.into_iter();
        let left = channels.next().unwrap_or_default();
        let right = channels.next().unwrap_or_else(|| left.clone());
        Self::new(left, right, sample_rate, source_channels)
    }

    pub fn left(&self) -> &[f32] {
        &self.left
    }

    pub fn right(&self) -> &[f32] {
        &self.right
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count of the decoded source before up/down-mixing
    pub fn source_channels(&self) -> usize {
        self.source_channels
    }

    /// Samples per channel
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.left.len() as f64 / self.sample_rate as f64
    }

    /// Average of both channels
    pub fn mono_mix(&self) -> Vec<f32> {
        self.left
            .iter()
            .zip(self.right.iter())
            .map(|(l, r)| 0.5 * (l + r))
            .collect()
    }
}

/// Input-to-PCM adapter
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Short identifier recorded in the report (e.g. "ffmpeg")
    fn name(&self) -> &'static str;

    async fn decode(&self, path: &Path) -> Result<CanonicalAudio, DecodeError>;
}

/// External tool decoder
pub struct FfmpegDecoder {
    program: PathBuf,
    fallback: Option<SymphoniaDecoder>,
}

impl FfmpegDecoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            fallback: None,
        }
    }

    /// Decode in-process when the tool cannot be spawned
    pub fn with_fallback(mut self, fallback: SymphoniaDecoder) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[async_trait]
impl Decoder for FfmpegDecoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn decode(&self, path: &Path) -> Result<CanonicalAudio, DecodeError> {
        if !path.exists() {
            return Err(DecodeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("input not found: {}", path.display()),
            )));
        }

        debug!(path = %path.display(), program = %self.program.display(), "Spawning decoder");

        let output = tokio::process::Command::new(&self.program)
            .arg("-nostdin")
            .args(["-v", "error"])
            .arg("-i")
            .arg(path)
            .args(["-f", "f32le", "-acodec", "pcm_f32le"])
            .args(["-ac", &TARGET_CHANNELS.to_string()])
            .args(["-ar", &TARGET_SAMPLE_RATE.to_string()])
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return match &self.fallback {
                    Some(fallback) => {
                        warn!(
                            program = %self.program.display(),
                            "Decoder tool not found, using in-process decoder"
                        );
                        fallback.decode(path).await
                    }
                    None => Err(DecodeError::Io(e)),
                };
            }
            Err(e) => return Err(DecodeError::Io(e)),
        };

        if !output.status.success() {
            return Err(DecodeError::Collaborator {
                status: output.status.code(),
                diagnostic: diagnostic_tail(&output.stderr),
            });
        }

        let samples = parse_f32le(&output.stdout);
        // ffmpeg already up/down-mixed to two channels
        CanonicalAudio::from_interleaved(&samples, TARGET_CHANNELS, TARGET_SAMPLE_RATE)
    }
}

/// Interpret little-endian f32 PCM; a trailing partial sample is ignored
pub fn parse_f32le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn diagnostic_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        return "no diagnostic output".to_string();
    }
    let skip = text.chars().count().saturating_sub(MAX_DIAGNOSTIC_CHARS);
    text.chars().skip(skip).collect()
}

/// In-process decoder
#[derive(Debug, Clone, Default)]
pub struct SymphoniaDecoder;

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Decoder for SymphoniaDecoder {
    fn name(&self) -> &'static str {
        "symphonia"
    }

    async fn decode(&self, path: &Path) -> Result<CanonicalAudio, DecodeError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || decode_file(&path))
            .await
            .map_err(|e| DecodeError::Internal(e.to_string()))?
    }
}

/// Decode a file with symphonia and resample to the canonical rate
///
/// **Algorithm:**
/// 1. Probe the container from the file extension hint
/// 2. Decode every packet of the first audio track to interleaved f32
/// 3. Split into channels and resample to 48 kHz when needed
/// 4. Duplicate mono / drop extra channels
pub fn decode_file(path: &Path) -> Result<CanonicalAudio, DecodeError> {
    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::Unsupported(format!("probe failed: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DecodeError::Unsupported("no audio track".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| DecodeError::Unsupported("unknown sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Unsupported(format!("no codec: {}", e)))?;

    let mut interleaved: Vec<f32> = Vec::new();
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(DecodeError::Unsupported(format!("read packet: {}", e))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                warn!(path = %path.display(), error = msg, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(DecodeError::Unsupported(format!("decode packet: {}", e))),
        };

        let spec = *decoded.spec();
        channels = spec.channels.count();
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(buf.samples());
    }

    if channels == 0 || interleaved.is_empty() {
        return Err(DecodeError::Empty);
    }

    debug!(
        path = %path.display(),
        sample_rate,
        channels,
        frames = interleaved.len() / channels,
        "Decoded with symphonia"
    );

    let planar = deinterleave(&interleaved, channels);
    let planar = resample_planar(planar, sample_rate, TARGET_SAMPLE_RATE)
        .map_err(DecodeError::Internal)?;
    CanonicalAudio::from_planar(planar, channels, TARGET_SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_is_duplicated() {
        let audio = CanonicalAudio::from_interleaved(&[0.1, 0.2, 0.3], 1, 48_000).unwrap();
        assert_eq!(audio.left(), audio.right());
        assert_eq!(audio.len(), 3);
        assert_eq!(audio.source_channels(), 1);
    }

    #[test]
    fn test_extra_channels_are_dropped() {
        // 2 frames of 3 channels
        let audio =
            CanonicalAudio::from_interleaved(&[0.1, 0.2, 0.9, 0.3, 0.4, 0.9], 3, 48_000).unwrap();
        assert_eq!(audio.left(), &[0.1, 0.3]);
        assert_eq!(audio.right(), &[0.2, 0.4]);
    }

    #[test]
    fn test_non_finite_rejected() {
        let result = CanonicalAudio::new(vec![0.0, f32::NAN], vec![0.0, 0.0], 48_000, 2);
        assert!(matches!(result, Err(DecodeError::NonFinite { frame: 1 })));
    }

    #[test]
    fn test_empty_rejected() {
        let result = CanonicalAudio::from_interleaved(&[], 2, 48_000);
        assert!(matches!(result, Err(DecodeError::Empty)));
    }

    #[test]
    fn test_parse_f32le_ignores_partial_tail() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-0.25f32).to_le_bytes());
        bytes.push(0xFF);
        assert_eq!(parse_f32le(&bytes), vec![0.5, -0.25]);
    }

    #[test]
    fn test_diagnostic_tail_keeps_end() {
        let long = "x".repeat(MAX_DIAGNOSTIC_CHARS) + "Invalid data found";
        let tail = diagnostic_tail(long.as_bytes());
        assert!(tail.ends_with("Invalid data found"));
        assert_eq!(tail.chars().count(), MAX_DIAGNOSTIC_CHARS);
        assert_eq!(diagnostic_tail(b"  "), "no diagnostic output");
    }

    #[tokio::test]
    async fn test_missing_tool_uses_fallback() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..4800 {
            let s = (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin() * 0.25;
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let decoder = FfmpegDecoder::new("/nonexistent/ffmpeg-binary")
            .with_fallback(SymphoniaDecoder::new());
        let audio = decoder.decode(&path).await.unwrap();

        assert_eq!(audio.sample_rate(), TARGET_SAMPLE_RATE);
        assert_eq!(audio.len(), 4800);
        assert_eq!(audio.left(), audio.right());
    }

    #[tokio::test]
    async fn test_missing_input_is_io_error() {
        let decoder = SymphoniaDecoder::new();
        let result = decoder.decode(Path::new("/nonexistent/input.wav")).await;
        assert!(matches!(result, Err(DecodeError::Io(_))));
    }
}
