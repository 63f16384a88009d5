//! Analysis job lifecycle
//!
//! A job moves `queued → processing → {completed, failed, error}`. The only backward edge is
//! `processing → queued`, taken by the orphan recovery sweep. `cancelled` is terminal and
//! reachable from either non-terminal status.

use chrono::{DateTime, Utc};
use mixscope_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    /// Pipeline could not produce a result (critical engine, budget, enqueue failure)
    Failed,
    /// Input is unusable or the job was quarantined after repeated orphaning
    Error,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Error,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a persisted status. Older rows may carry `done`, read as `completed`.
    pub fn from_stored(value: &str) -> Result<Self> {
        match value {
            "done" => Ok(JobStatus::Completed),
            other => other.parse(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Error)
                | (Processing, Cancelled)
                | (Processing, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job status '{}'", s)))
    }
}

/// How the report is scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
    /// Score against a bundled genre profile
    #[default]
    Genre,
    /// Analyze `reference_ref` (a file) in the same job and score against it
    Comparison,
    /// Capture a reference report, no scoring
    ReferenceBase,
    /// Score against the report of a completed `reference-base` job
    ReferenceCompare,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Genre => "genre",
            AnalysisMode::Comparison => "comparison",
            AnalysisMode::ReferenceBase => "reference-base",
            AnalysisMode::ReferenceCompare => "reference-compare",
        }
    }

    pub fn requires_reference(&self) -> bool {
        matches!(self, AnalysisMode::Comparison | AnalysisMode::ReferenceCompare)
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "genre" => Ok(AnalysisMode::Genre),
            "comparison" => Ok(AnalysisMode::Comparison),
            "reference-base" => Ok(AnalysisMode::ReferenceBase),
            "reference-compare" => Ok(AnalysisMode::ReferenceCompare),
            other => Err(Error::InvalidInput(format!("unknown analysis mode '{}'", other))),
        }
    }
}

/// Submission boundary payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub input_ref: String,
    #[serde(default)]
    pub reference_ref: Option<String>,
    #[serde(default)]
    pub mode: AnalysisMode,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Genre profile key; `default` when absent
    #[serde(default)]
    pub genre: Option<String>,
    /// Earlier iteration of the same mix, for adaptive re-scoring
    #[serde(default)]
    pub previous_job_id: Option<Uuid>,
}

impl JobSubmission {
    pub fn new(input_ref: impl Into<String>, mode: AnalysisMode) -> Self {
        Self {
            input_ref: input_ref.into(),
            mode,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_ref.trim().is_empty() {
            return Err(Error::InvalidInput("input_ref must not be empty".to_string()));
        }

        let reference = self
            .reference_ref
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        if self.mode.requires_reference() && reference.is_none() {
            return Err(Error::InvalidInput(format!(
                "mode '{}' requires reference_ref",
                self.mode
            )));
        }
        if self.mode == AnalysisMode::ReferenceCompare {
            if let Some(reference) = reference {
                Uuid::parse_str(reference).map_err(|_| {
                    Error::InvalidInput(format!(
                        "reference_ref '{}' is not a job id",
                        reference
                    ))
                })?;
            }
        }
        Ok(())
    }
}

/// Persisted job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub input_ref: String,
    pub reference_ref: Option<String>,
    pub mode: AnalysisMode,
    pub status: JobStatus,
    pub progress_pct: u8,
    pub progress_message: Option<String>,
    /// `None` until evaluated
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub display_name: Option<String>,
    pub genre: Option<String>,
    pub previous_job_id: Option<Uuid>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub recovery_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(submission: JobSubmission) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            input_ref: submission.input_ref,
            reference_ref: submission.reference_ref,
            mode: submission.mode,
            status: JobStatus::Queued,
            progress_pct: 0,
            progress_message: None,
            result: None,
            error: None,
            display_name: submission.display_name,
            genre: submission.genre,
            previous_job_id: submission.previous_job_id,
            heartbeat_at: None,
            recovery_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `next`, refusing illegal edges
    pub fn transition_to(&mut self, next: JobStatus) -> Result<StateTransition> {
        let transition = StateTransition::new(self.id, self.status, next)?;
        self.status = next;
        self.updated_at = transition.transitioned_at;
        if next.is_terminal() {
            self.completed_at = Some(transition.transitioned_at);
        }
        Ok(transition)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn genre_key(&self) -> &str {
        self.genre.as_deref().unwrap_or("default")
    }
}

/// A validated status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub job_id: Uuid,
    pub old_status: JobStatus,
    pub new_status: JobStatus,
    pub transitioned_at: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(job_id: Uuid, old_status: JobStatus, new_status: JobStatus) -> Result<Self> {
        if !old_status.can_transition_to(new_status) {
            return Err(Error::InvalidInput(format!(
                "illegal transition {} -> {} for job {}",
                old_status, new_status, job_id
            )));
        }
        Ok(Self {
            job_id,
            old_status,
            new_status,
            transitioned_at: Utc::now(),
        })
    }
}

/// Status/result boundary payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub mode: AnalysisMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub progress_pct: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recovery_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            mode: job.mode,
            display_name: job.display_name,
            progress_pct: job.progress_pct,
            progress_message: job.progress_message,
            result: job.result,
            error: job.error,
            recovery_count: job.recovery_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}
