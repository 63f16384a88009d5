//! Analysis pipeline
//!
//! decode → segment → fan out six engines → aggregate.
//!
//! Engines are CPU-bound and run on the blocking pool, each under its own timeout, joined
//! with a single barrier. Loudness and true peak are critical: without them no score can be
//! computed, so their timeout or failure fails the job. Spectral, tempo, dynamics and stereo
//! degrade to explicit "not calculated" sections.

pub mod aggregator;
pub mod decoder;
pub mod dynamics;
pub mod fft;
pub mod loudness;
pub mod sanitizer;
pub mod segmentation;
pub mod spectral;
pub mod stereo;
pub mod tempo;
pub mod true_peak;

use async_trait::async_trait;
use mixscope_common::config::{DecoderKind, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::models::report::{EngineDiagnostic, EngineOutcome, TechnicalReport};
use aggregator::FileMeta;
use decoder::{DecodeError, Decoder, FfmpegDecoder, SymphoniaDecoder};
use dynamics::{DynamicsEngine, DynamicsRecord};
use loudness::{LoudnessEngine, LoudnessRecord};
use segmentation::{SegmentationOptions, SegmentedAudio, DEFAULT_MAX_FRAMES};
use spectral::{SpectralEngine, SpectralRecord};
use stereo::{StereoEngine, StereoRecord};
use tempo::{TempoEngine, TempoRecord};
use true_peak::{InterpolationOrder, TruePeakEngine, TruePeakRecord};

/// Metric engines, in report order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Loudness,
    TruePeak,
    Spectral,
    Tempo,
    Dynamics,
    Stereo,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Loudness => "loudness",
            EngineKind::TruePeak => "true_peak",
            EngineKind::Spectral => "spectral",
            EngineKind::Tempo => "tempo",
            EngineKind::Dynamics => "dynamics",
            EngineKind::Stereo => "stereo",
        }
    }

    /// A critical engine's absence fails the job
    pub fn is_critical(&self) -> bool {
        matches!(self, EngineKind::Loudness | EngineKind::TruePeak)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline failure taxonomy
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("{engine} engine exceeded {budget_ms} ms")]
    EngineTimeout { engine: EngineKind, budget_ms: u64 },

    #[error("{engine} engine failed: {reason}")]
    EngineFailed { engine: EngineKind, reason: String },

    #[error("job exceeded its {budget_ms} ms budget")]
    JobBudgetExceeded { budget_ms: u64 },

    #[error("reference unavailable: {0}")]
    Reference(String),

    #[error("job cancelled")]
    Cancelled,
}

/// One engine's output
#[derive(Debug, Clone)]
pub enum EngineOutput {
    Loudness(LoudnessRecord),
    TruePeak(TruePeakRecord),
    Spectral(SpectralRecord),
    Tempo(TempoRecord),
    Dynamics(Option<DynamicsRecord>),
    Stereo(Option<StereoRecord>),
}

/// Outcome of one engine call
#[derive(Debug, Clone)]
pub struct EngineRun {
    pub kind: EngineKind,
    pub outcome: EngineOutcome,
    pub elapsed_ms: u64,
    pub detail: Option<String>,
    pub output: Option<EngineOutput>,
}

impl EngineRun {
    pub fn ok(kind: EngineKind, output: EngineOutput, elapsed_ms: u64) -> Self {
        Self {
            kind,
            outcome: EngineOutcome::Ok,
            elapsed_ms,
            detail: None,
            output: Some(output),
        }
    }

    pub fn timed_out(kind: EngineKind, elapsed_ms: u64) -> Self {
        Self {
            kind,
            outcome: EngineOutcome::Timeout,
            elapsed_ms,
            detail: Some(format!("timed out after {} ms", elapsed_ms)),
            output: None,
        }
    }

    pub fn failed(kind: EngineKind, reason: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            kind,
            outcome: EngineOutcome::Failed,
            elapsed_ms,
            detail: Some(reason.into()),
            output: None,
        }
    }

    /// Not run; `output` may still carry a not-calculated record
    pub fn skipped(kind: EngineKind, reason: impl Into<String>, output: Option<EngineOutput>) -> Self {
        Self {
            kind,
            outcome: EngineOutcome::Skipped,
            elapsed_ms: 0,
            detail: Some(reason.into()),
            output,
        }
    }
}

/// Engine runs keyed by kind
#[derive(Debug, Clone, Default)]
pub struct EngineResults {
    runs: BTreeMap<EngineKind, EngineRun>,
}

impl EngineResults {
    pub fn new(runs: impl IntoIterator<Item = EngineRun>) -> Self {
        Self {
            runs: runs.into_iter().map(|run| (run.kind, run)).collect(),
        }
    }

    pub fn get(&self, kind: EngineKind) -> Option<&EngineRun> {
        self.runs.get(&kind)
    }

    pub fn output(&self, kind: EngineKind) -> Option<&EngineOutput> {
        self.runs.get(&kind).and_then(|run| run.output.as_ref())
    }

    pub fn diagnostics(&self) -> BTreeMap<EngineKind, EngineDiagnostic> {
        self.runs
            .iter()
            .map(|(kind, run)| {
                (
                    *kind,
                    EngineDiagnostic {
                        outcome: run.outcome,
                        elapsed_ms: run.elapsed_ms,
                        detail: run.detail.clone(),
                    },
                )
            })
            .collect()
    }

    /// Error for a critical engine that produced nothing
    pub fn critical_error(&self, kind: EngineKind) -> PipelineError {
        match self.runs.get(&kind) {
            Some(run) if run.outcome == EngineOutcome::Timeout => PipelineError::EngineTimeout {
                engine: kind,
                budget_ms: run.elapsed_ms,
            },
            Some(run) => PipelineError::EngineFailed {
                engine: kind,
                reason: run
                    .detail
                    .clone()
                    .unwrap_or_else(|| "no output".to_string()),
            },
            None => PipelineError::EngineFailed {
                engine: kind,
                reason: "engine did not run".to_string(),
            },
        }
    }

    pub fn unavailable_reason(&self, kind: EngineKind) -> String {
        match self.runs.get(&kind).and_then(|run| run.detail.clone()) {
            Some(detail) => format!("{} engine unavailable: {}", kind, detail),
            None => format!("{} engine unavailable", kind),
        }
    }
}

/// Wall-clock limit that blocking engine loops poll between frame batches. The engine task
/// on the blocking pool cannot be aborted, so it has to notice the timeout itself.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(budget),
        }
    }

    /// Never expires
    pub fn unbounded() -> Self {
        Self { at: None }
    }

    pub fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Progress notifications from inside a pipeline run
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, pct: u8, message: &str);
}

/// Discards progress
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _pct: u8, _message: &str) {}
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub decode_timeout: Duration,
    pub engine_timeout: Duration,
    pub loudness_budget: Duration,
    pub max_frames: usize,
    pub interpolation: InterpolationOrder,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            decode_timeout: Duration::from_secs(60),
            engine_timeout: Duration::from_secs(60),
            loudness_budget: Duration::from_secs(60),
            max_frames: DEFAULT_MAX_FRAMES,
            interpolation: InterpolationOrder::default(),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            decode_timeout: config.decode_timeout(),
            engine_timeout: config.engine_timeout(),
            loudness_budget: config.loudness_budget(),
            max_frames: config.max_frames,
            interpolation: InterpolationOrder::default(),
        }
    }
}

/// Decoder selected by configuration
pub fn decoder_from_config(config: &PipelineConfig) -> Arc<dyn Decoder> {
    match config.decoder {
        DecoderKind::Ffmpeg => Arc::new(
            FfmpegDecoder::new(config.ffmpeg_path.clone()).with_fallback(SymphoniaDecoder::new()),
        ),
        DecoderKind::Symphonia => Arc::new(SymphoniaDecoder::new()),
    }
}

/// Decoder plus engines; shared by every worker
pub struct AnalysisPipeline {
    decoder: Arc<dyn Decoder>,
    spectral: Arc<SpectralEngine>,
    options: PipelineOptions,
}

impl AnalysisPipeline {
    pub fn new(decoder: Arc<dyn Decoder>, options: PipelineOptions) -> Self {
        Self {
            decoder,
            spectral: Arc::new(SpectralEngine::new()),
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Analyze one input file
    pub async fn analyze(
        &self,
        path: &Path,
        display_name: Option<String>,
        progress: &dyn ProgressSink,
    ) -> Result<TechnicalReport, PipelineError> {
        let started = Instant::now();

        let audio = match tokio::time::timeout(self.options.decode_timeout, self.decoder.decode(path))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(DecodeError::Timeout {
                    secs: self.options.decode_timeout.as_secs(),
                }
                .into())
            }
        };
        debug!(
            path = %path.display(),
            decoder = self.decoder.name(),
            samples = audio.len(),
            duration_s = audio.duration_seconds(),
            "Decoded input"
        );
        progress.report(10, "decoded").await;

        let audio = Arc::new(audio);
        let options = SegmentationOptions::for_sample_rate(audio.sample_rate(), self.options.max_frames);
        let segmented = Arc::new(SegmentedAudio::new(Arc::clone(&audio), &options));
        progress.report(25, "segmented").await;

        let results = self.run_engines(&audio, &segmented).await;
        progress.report(75, "metrics computed").await;

        let meta = FileMeta {
            input_ref: path.display().to_string(),
            display_name,
            decoder: self.decoder.name(),
        };
        let report = aggregator::aggregate(&meta, &segmented, &results)?;

        info!(
            path = %path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            integrated_lufs = ?report.loudness.integrated_lufs,
            max_dbtp = ?report.true_peak.max_dbtp,
            "Analysis complete"
        );
        Ok(report)
    }

    async fn run_engines(
        &self,
        audio: &Arc<decoder::CanonicalAudio>,
        segmented: &Arc<SegmentedAudio>,
    ) -> EngineResults {
        let budget = self.options.engine_timeout;

        let loudness = {
            let audio = Arc::clone(audio);
            let layout = segmented.loudness_layout();
            let engine = LoudnessEngine::new(self.options.loudness_budget);
            run_engine(EngineKind::Loudness, budget, move || {
                EngineOutput::Loudness(engine.measure(
                    audio.left(),
                    audio.right(),
                    audio.sample_rate(),
                    layout,
                ))
            })
        };

        let true_peak = {
            let audio = Arc::clone(audio);
            let engine = TruePeakEngine::new(self.options.interpolation);
            run_engine(EngineKind::TruePeak, budget, move || {
                EngineOutput::TruePeak(engine.measure(audio.left(), audio.right()))
            })
        };

        let spectral = {
            let segmented = Arc::clone(segmented);
            let engine = Arc::clone(&self.spectral);
            async move {
                if segmented.fft_layout().count == 0 {
                    let record = engine.measure(&segmented);
                    return EngineRun::skipped(
                        EngineKind::Spectral,
                        "signal shorter than one FFT frame",
                        Some(EngineOutput::Spectral(record)),
                    );
                }
                let deadline = Deadline::after(budget);
                run_engine(EngineKind::Spectral, budget, move || {
                    EngineOutput::Spectral(engine.measure_within(&segmented, deadline))
                })
                .await
            }
        };

        let tempo = {
            let audio = Arc::clone(audio);
            let deadline = Deadline::after(budget);
            run_engine(EngineKind::Tempo, budget, move || {
                EngineOutput::Tempo(TempoEngine::new().measure_within(&audio, deadline))
            })
        };

        let dynamics = {
            let audio = Arc::clone(audio);
            run_engine(EngineKind::Dynamics, budget, move || {
                EngineOutput::Dynamics(DynamicsEngine::new().measure(&audio))
            })
        };

        let stereo = {
            let audio = Arc::clone(audio);
            run_engine(EngineKind::Stereo, budget, move || {
                EngineOutput::Stereo(StereoEngine::new().measure(&audio))
            })
        };

        let (loudness, true_peak, spectral, tempo, dynamics, stereo) =
            tokio::join!(loudness, true_peak, spectral, tempo, dynamics, stereo);
        EngineResults::new([loudness, true_peak, spectral, tempo, dynamics, stereo])
    }
}

async fn run_engine<F>(kind: EngineKind, budget: Duration, work: F) -> EngineRun
where
    F: FnOnce() -> EngineOutput + Send + 'static,
{
    let started = Instant::now();
    let handle = tokio::task::spawn_blocking(work);
    let result = tokio::time::timeout(budget, handle).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(output)) => {
            debug!(engine = %kind, elapsed_ms, "Engine finished");
            EngineRun::ok(kind, output, elapsed_ms)
        }
        Ok(Err(join_error)) => {
            if kind.is_critical() {
                error!(engine = %kind, error = %join_error, "Critical engine failed");
            } else {
                warn!(engine = %kind, error = %join_error, "Engine failed, degrading");
            }
            EngineRun::failed(kind, join_error.to_string(), elapsed_ms)
        }
        Err(_) => {
            if kind.is_critical() {
                error!(engine = %kind, budget_ms = budget.as_millis() as u64, "Critical engine timed out");
            } else {
                warn!(engine = %kind, budget_ms = budget.as_millis() as u64, "Engine timed out, degrading");
            }
            EngineRun::timed_out(kind, budget.as_millis() as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::decoder::CanonicalAudio;
    use std::sync::Mutex;

    struct ToneDecoder {
        seconds: f64,
    }

    #[async_trait]
    impl Decoder for ToneDecoder {
        fn name(&self) -> &'static str {
            "tone"
        }

        async fn decode(&self, _path: &Path) -> Result<CanonicalAudio, DecodeError> {
            let tone: Vec<f32> = (0..(self.seconds * 48_000.0) as usize)
                .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin())
                .collect();
            CanonicalAudio::new(tone.clone(), tone, 48_000, 2)
        }
    }

    struct FailingDecoder;

    #[async_trait]
    impl Decoder for FailingDecoder {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn decode(&self, _path: &Path) -> Result<CanonicalAudio, DecodeError> {
            Err(DecodeError::Collaborator {
                status: Some(1),
                diagnostic: "Invalid data found when processing input".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<u8>>);

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn report(&self, pct: u8, _message: &str) {
            self.0.lock().unwrap().push(pct);
        }
    }

    #[tokio::test]
    async fn test_analyze_reports_progress_and_every_engine() {
        let pipeline = AnalysisPipeline::new(Arc::new(ToneDecoder { seconds: 2.0 }), PipelineOptions::default());
        let sink = RecordingSink::default();

        let report = pipeline.analyze(Path::new("tone.wav"), None, &sink).await.unwrap();

        assert_eq!(*sink.0.lock().unwrap(), vec![10, 25, 75]);
        assert_eq!(report.diagnostics.engines.len(), 6);
        assert!(report
            .diagnostics
            .engines
            .values()
            .all(|d| d.outcome == EngineOutcome::Ok));
        assert_eq!(report.file.decoder, "tone");
    }

    #[tokio::test]
    async fn test_short_input_skips_spectral() {
        let pipeline = AnalysisPipeline::new(Arc::new(ToneDecoder { seconds: 0.05 }), PipelineOptions::default());
        let report = pipeline.analyze(Path::new("blip.wav"), None, &NoProgress).await.unwrap();

        assert_eq!(
            report.diagnostics.engines[&EngineKind::Spectral].outcome,
            EngineOutcome::Skipped
        );
        assert!(report.spectral.reason.is_some());
    }

    #[tokio::test]
    async fn test_decode_error_carries_collaborator_diagnostic() {
        let pipeline = AnalysisPipeline::new(Arc::new(FailingDecoder), PipelineOptions::default());
        let err = pipeline
            .analyze(Path::new("broken.mp3"), None, &NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Decode(_)));
        assert!(err.to_string().contains("Invalid data found"));
    }

    #[tokio::test]
    async fn test_engine_timeout_is_recorded() {
        let run = run_engine(EngineKind::Tempo, Duration::from_millis(10), || {
            std::thread::sleep(Duration::from_millis(200));
            EngineOutput::Dynamics(None)
        })
        .await;

        assert_eq!(run.outcome, EngineOutcome::Timeout);
        assert!(run.output.is_none());
    }

    #[test]
    fn test_deadline() {
        assert!(Deadline::after(Duration::ZERO).expired());
        assert!(!Deadline::after(Duration::from_secs(60)).expired());
        assert!(!Deadline::unbounded().expired());
    }

    #[tokio::test]
    async fn test_engine_panic_is_failure_not_crash() {
        let run = run_engine(EngineKind::Stereo, Duration::from_secs(5), || -> EngineOutput {
            panic!("boom")
        })
        .await;
        assert_eq!(run.outcome, EngineOutcome::Failed);
    }
}
