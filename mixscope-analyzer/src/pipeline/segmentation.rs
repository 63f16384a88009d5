//! Temporal segmentation
//!
//! Derives two independent framings from one [`CanonicalAudio`]:
//! - FFT frames: 4096-sample Hann-windowed frames with a 20 ms hop
//! - Loudness blocks: 400 ms unwindowed blocks with a 100 ms hop (75% overlap)
//!
//! Frames are descriptors over the shared signal; samples are copied (and windowed)
//! only when an engine asks for a frame, so memory stays proportional to the signal.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::warn;

use super::decoder::CanonicalAudio;

/// FFT frame length in samples
pub const FFT_SIZE: usize = 4096;

/// FFT hop expressed in seconds (960 samples at 48 kHz)
pub const FFT_HOP_SECONDS: f64 = 0.020;

/// Loudness hop in seconds
pub const LOUDNESS_HOP_SECONDS: f64 = 0.100;

/// A 400 ms gating block spans four 100 ms hops
pub const LOUDNESS_HOPS_PER_BLOCK: usize = 4;

/// Default ceiling on the number of frames of either framing
pub const DEFAULT_MAX_FRAMES: usize = 100_000;

/// Frame count, size and hop of one framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub size: usize,
    pub hop: usize,
    pub count: usize,
    /// True when the ceiling cut the frame count short
    pub truncated: bool,
}

impl FrameLayout {
    /// `count = floor((len - size) / hop) + 1`, zero when the signal is shorter than one
    /// frame or the geometry is degenerate, and never more than `max_frames`.
    pub fn compute(signal_len: usize, size: usize, hop: usize, max_frames: usize) -> Self {
        let natural = if size == 0 || hop == 0 || signal_len < size {
            0
        } else {
            (signal_len - size) / hop + 1
        };

        let truncated = natural > max_frames;
        if truncated {
            warn!(
                natural_frames = natural,
                max_frames,
                size,
                hop,
                "Frame count exceeds ceiling, truncating"
            );
        }

        Self {
            size,
            hop,
            count: natural.min(max_frames),
            truncated,
        }
    }

    /// First sample of frame `index`
    pub fn start(&self, index: usize) -> usize {
        index * self.hop
    }

    /// Start time of frame `index` in seconds
    pub fn timestamp(&self, index: usize, sample_rate: u32) -> f64 {
        self.start(index) as f64 / sample_rate as f64
    }
}

/// Options controlling the framings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentationOptions {
    pub fft_size: usize,
    pub fft_hop: usize,
    pub loudness_hop: usize,
    pub max_frames: usize,
}

impl SegmentationOptions {
    pub fn for_sample_rate(sample_rate: u32, max_frames: usize) -> Self {
        let rate = sample_rate as f64;
        Self {
            fft_size: FFT_SIZE,
            fft_hop: ((FFT_HOP_SECONDS * rate).round() as usize).max(1),
            loudness_hop: ((LOUDNESS_HOP_SECONDS * rate).round() as usize).max(1),
            max_frames,
        }
    }

    /// 400 ms loudness blocks over a signal of `signal_len` samples
    pub fn loudness_layout(&self, signal_len: usize) -> FrameLayout {
        FrameLayout::compute(
            signal_len,
            self.loudness_hop * LOUDNESS_HOPS_PER_BLOCK,
            self.loudness_hop,
            self.max_frames,
        )
    }
}

/// One windowed FFT frame
#[derive(Debug, Clone)]
pub struct FftFrame {
    pub index: usize,
    pub timestamp: f64,
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

/// Framed view over a decoded signal
#[derive(Debug, Clone)]
pub struct SegmentedAudio {
    audio: Arc<CanonicalAudio>,
    fft: FrameLayout,
    loudness: FrameLayout,
    window: Arc<[f32]>,
}

impl SegmentedAudio {
    pub fn new(audio: Arc<CanonicalAudio>, options: &SegmentationOptions) -> Self {
        let len = audio.len();
        let fft = FrameLayout::compute(len, options.fft_size, options.fft_hop, options.max_frames);
        let loudness = options.loudness_layout(len);

        Self {
            audio,
            fft,
            loudness,
            window: hann_window(options.fft_size).into(),
        }
    }

    pub fn audio(&self) -> &CanonicalAudio {
        &self.audio
    }

    pub fn sample_rate(&self) -> u32 {
        self.audio.sample_rate()
    }

    pub fn fft_layout(&self) -> FrameLayout {
        self.fft
    }

    pub fn loudness_layout(&self) -> FrameLayout {
        self.loudness
    }

    pub fn window(&self) -> &[f32] {
        &self.window
    }

    /// Windowed FFT frame `index`, or `None` past the end of the layout
    pub fn fft_frame(&self, index: usize) -> Option<FftFrame> {
        if index >= self.fft.count {
            return None;
        }
        let start = self.fft.start(index);
        let end = start + self.fft.size;
        let apply = |samples: &[f32]| -> Vec<f32> {
            samples[start..end]
                .iter()
                .zip(self.window.iter())
                .map(|(s, w)| s * w)
                .collect()
        };

        Some(FftFrame {
            index,
            timestamp: self.fft.timestamp(index, self.sample_rate()),
            left: apply(self.audio.left()),
            right: apply(self.audio.right()),
        })
    }

    /// Iterate every FFT frame in order
    pub fn fft_frames(&self) -> impl Iterator<Item = FftFrame> + '_ {
        (0..self.fft.count).filter_map(move |i| self.fft_frame(i))
    }
}

/// Symmetric Hann window `0.5 - 0.5·cos(2πn/(N-1))`
pub fn hann_window(size: usize) -> Vec<f32> {
    if size <= 1 {
        return vec![1.0; size];
    }
    let denom = (size - 1) as f64;
    (0..size)
        .map(|n| (0.5 - 0.5 * (2.0 * PI * n as f64 / denom).cos()) as f32)
        .collect()
}
