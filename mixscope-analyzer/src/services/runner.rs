//! Runs one claimed job: profile resolution, analysis, scoring
//!
//! The whole run sits under the job's wall-clock budget and its cancellation token.

use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::jobs;
use crate::models::job::{AnalysisMode, Job, JobStatus};
use crate::models::report::AnalysisResult;
use crate::pipeline::{AnalysisPipeline, NoProgress, PipelineError, ProgressSink};
use crate::scoring::{score, ReferenceProfile, ScoringResult};

/// Status a job ends in for a pipeline error
pub fn failure_status(err: &PipelineError) -> JobStatus {
    match err {
        PipelineError::Decode(_) => JobStatus::Error,
        PipelineError::Cancelled => JobStatus::Cancelled,
        PipelineError::EngineTimeout { .. }
        | PipelineError::EngineFailed { .. }
        | PipelineError::JobBudgetExceeded { .. }
        | PipelineError::Reference(_) => JobStatus::Failed,
    }
}

pub struct JobRunner {
    pipeline: Arc<AnalysisPipeline>,
    pool: SqlitePool,
    job_budget: Duration,
}

impl JobRunner {
    pub fn new(pipeline: Arc<AnalysisPipeline>, pool: SqlitePool, job_budget: Duration) -> Self {
        Self {
            pipeline,
            pool,
            job_budget,
        }
    }

    /// Analyze and score `job`
    pub async fn run(
        &self,
        job: &Job,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, PipelineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            outcome = tokio::time::timeout(self.job_budget, self.execute(job, progress)) => {
                outcome.unwrap_or(Err(PipelineError::JobBudgetExceeded {
                    budget_ms: self.job_budget.as_millis() as u64,
                }))
            }
        }
    }

    async fn execute(&self, job: &Job, progress: &dyn ProgressSink) -> Result<AnalysisResult, PipelineError> {
        // Stored references resolve before the expensive analysis so a bad id fails fast
        let stored_profile = match job.mode {
            AnalysisMode::Genre => Some(
                ReferenceProfile::genre(job.genre_key())
                    .map_err(|e| PipelineError::Reference(e.to_string()))?,
            ),
            AnalysisMode::ReferenceCompare => Some(self.stored_reference(job).await?),
            AnalysisMode::Comparison | AnalysisMode::ReferenceBase => None,
        };

        let report = self
            .pipeline
            .analyze(Path::new(&job.input_ref), job.display_name.clone(), progress)
            .await?;

        let profile = match job.mode {
            AnalysisMode::ReferenceBase => None,
            AnalysisMode::Comparison => Some(self.analyze_reference_file(job).await?),
            AnalysisMode::Genre | AnalysisMode::ReferenceCompare => stored_profile,
        };

        let scoring = match profile {
            Some(profile) => {
                let previous = self.previous_scoring(job).await;
                let scoring = score(&report, &profile, previous.as_ref());
                progress.report(90, "scored").await;
                Some(scoring)
            }
            None => None,
        };

        Ok(AnalysisResult { report, scoring })
    }

    fn reference_ref<'a>(&self, job: &'a Job) -> Result<&'a str, PipelineError> {
        job.reference_ref
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| PipelineError::Reference(format!("mode '{}' requires reference_ref", job.mode)))
    }

    async fn analyze_reference_file(&self, job: &Job) -> Result<ReferenceProfile, PipelineError> {
        let path = self.reference_ref(job)?;
        let report = self
            .pipeline
            .analyze(Path::new(path), None, &NoProgress)
            .await
            .map_err(|e| PipelineError::Reference(format!("reference file '{}': {}", path, e)))?;
        ReferenceProfile::from_report(format!("reference:{}", path), &report)
            .map_err(|e| PipelineError::Reference(e.to_string()))
    }

    async fn stored_reference(&self, job: &Job) -> Result<ReferenceProfile, PipelineError> {
        let reference = self.reference_ref(job)?;
        let reference_id = Uuid::parse_str(reference.trim())
            .map_err(|_| PipelineError::Reference(format!("'{}' is not a job id", reference)))?;

        let result = self.completed_result(reference_id).await?;
        let base = result.ok_or_else(|| {
            PipelineError::Reference(format!("reference job {} has no completed result", reference_id))
        })?;
        ReferenceProfile::from_report(format!("reference:{}", reference_id), &base.report)
            .map_err(|e| PipelineError::Reference(e.to_string()))
    }

    /// Stored result of a completed job; `Ok(None)` when the job is missing or unfinished
    async fn completed_result(&self, job_id: Uuid) -> Result<Option<AnalysisResult>, PipelineError> {
        let job = jobs::get_job(&self.pool, job_id)
            .await
            .map_err(|e| PipelineError::Reference(e.to_string()))?;

        let Some(job) = job else {
            return Ok(None);
        };
        if job.status != JobStatus::Completed {
            return Ok(None);
        }
        job.result
            .map(serde_json::from_value::<AnalysisResult>)
            .transpose()
            .map_err(|e| PipelineError::Reference(format!("stored result of {} is unreadable: {}", job_id, e)))
    }

    /// Scoring of the previous iteration, when there is one. Never fails the job.
    async fn previous_scoring(&self, job: &Job) -> Option<ScoringResult> {
        let previous_id = job.previous_job_id?;
        match self.completed_result(previous_id).await {
            Ok(Some(result)) => {
                debug!(job_id = %job.id, previous = %previous_id, "Adaptive re-scoring against previous iteration");
                result.scoring
            }
            Ok(None) => {
                warn!(job_id = %job.id, previous = %previous_id, "Previous iteration not completed, skipping adaptive score");
                None
            }
            Err(e) => {
                warn!(job_id = %job.id, previous = %previous_id, error = %e, "Previous iteration unreadable, skipping adaptive score");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::models::job::JobSubmission;
    use crate::pipeline::decoder::{CanonicalAudio, DecodeError, Decoder};
    use crate::pipeline::PipelineOptions;
    use async_trait::async_trait;

    /// 440 Hz at amplitude 0.5 for any path containing "tone", a decode error otherwise
    struct FakeDecoder {
        delay: Duration,
    }

    #[async_trait]
    impl Decoder for FakeDecoder {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn decode(&self, path: &Path) -> Result<CanonicalAudio, DecodeError> {
            tokio::time::sleep(self.delay).await;
            if !path.to_string_lossy().contains("tone") {
                return Err(DecodeError::Unsupported(format!("{}", path.display())));
            }
            let tone: Vec<f32> = (0..96_000)
                .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin())
                .collect();
            CanonicalAudio::new(tone.clone(), tone, 48_000, 2)
        }
    }

    async fn runner(delay: Duration, budget: Duration) -> JobRunner {
        let pipeline = AnalysisPipeline::new(Arc::new(FakeDecoder { delay }), PipelineOptions::default());
        JobRunner::new(Arc::new(pipeline), memory_pool().await, budget)
    }

    fn job(input: &str, mode: AnalysisMode) -> Job {
        Job::new(JobSubmission::new(input, mode))
    }

    #[tokio::test]
    async fn test_genre_mode_scores_against_profile() {
        let runner = runner(Duration::ZERO, Duration::from_secs(60)).await;
        let result = runner
            .run(&job("tone.wav", AnalysisMode::Genre), &NoProgress, &CancellationToken::new())
            .await
            .unwrap();

        let scoring = result.scoring.unwrap();
        assert_eq!(scoring.profile, "default");
        assert!(scoring.score_pct.is_some());
        assert!(!scoring.suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_reference_base_has_no_scoring() {
        let runner = runner(Duration::ZERO, Duration::from_secs(60)).await;
        let result = runner
            .run(&job("tone.wav", AnalysisMode::ReferenceBase), &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.scoring.is_none());
    }

    #[tokio::test]
    async fn test_comparison_against_identical_file_scores_high() {
        let runner = runner(Duration::ZERO, Duration::from_secs(60)).await;
        let mut comparison = job("tone.wav", AnalysisMode::Comparison);
        comparison.reference_ref = Some("tone-reference.wav".to_string());

        let result = runner
            .run(&comparison, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        let scoring = result.scoring.unwrap();
        assert!(scoring.profile.starts_with("reference:"));
        assert!(scoring.score_pct.unwrap() >= 90.0);
    }

    #[tokio::test]
    async fn test_unfinished_reference_job_fails_explicitly() {
        let runner = runner(Duration::ZERO, Duration::from_secs(60)).await;
        let mut compare = job("tone.wav", AnalysisMode::ReferenceCompare);
        compare.reference_ref = Some(Uuid::new_v4().to_string());

        let err = runner
            .run(&compare, &NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Reference(_)));
        assert_eq!(failure_status(&err), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_decode_error_maps_to_error_status() {
        let runner = runner(Duration::ZERO, Duration::from_secs(60)).await;
        let err = runner
            .run(&job("corrupt.bin", AnalysisMode::Genre), &NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
        assert_eq!(failure_status(&err), JobStatus::Error);
    }

    #[tokio::test]
    async fn test_job_budget_force_fails() {
        let runner = runner(Duration::from_secs(5), Duration::from_millis(50)).await;
        let err = runner
            .run(&job("tone.wav", AnalysisMode::Genre), &NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::JobBudgetExceeded { budget_ms: 50 }));
    }

    #[tokio::test]
    async fn test_cancellation_stops_run() {
        let runner = runner(Duration::from_secs(5), Duration::from_secs(60)).await;
        let token = CancellationToken::new();
        token.cancel();
        let err = runner
            .run(&job("tone.wav", AnalysisMode::Genre), &NoProgress, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
