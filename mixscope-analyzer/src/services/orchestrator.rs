//! Job orchestrator
//!
//! Owns the job lifecycle across the work queue and the job store:
//! submit → claim → heartbeat/progress → complete | fail, plus the orphan recovery sweep
//! and explicit cancellation. Every status change is published on the [`EventBus`].
//!
//! Queue handlers are idempotent: a redelivered item whose job is already terminal is acked
//! and skipped, and store writes only apply from the expected predecessor status.

use chrono::Utc;
use mixscope_common::config::{RecoveryConfig, WorkerConfig};
use mixscope_common::events::{EventBus, JobEvent};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::jobs;
use crate::models::job::{Job, JobStatus, JobSubmission};
use crate::models::report::AnalysisResult;
use crate::pipeline::ProgressSink;
use crate::queue::{LeasedItem, QueueDepth, QueueError, WorkQueue};
use crate::scoring::ReferenceProfile;
use crate::utils::retry_with_backoff;

/// Items inspected per claim before giving up for this poll
const MAX_SKIPS_PER_CLAIM: usize = 16;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] mixscope_common::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to enqueue: {0}")]
    Enqueue(QueueError),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: JobStatus },
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Timing and retry limits
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub lease: Duration,
    pub orphan_threshold: Duration,
    pub max_recoveries: u32,
    /// Total wait for queue transport retries
    pub max_retry_wait: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default(), &RecoveryConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(worker: &WorkerConfig, recovery: &RecoveryConfig) -> Self {
        Self {
            lease: worker.lease(),
            orphan_threshold: recovery.orphan_threshold(),
            max_recoveries: recovery.max_recoveries,
            max_retry_wait: Duration::from_millis(worker.max_retry_wait_ms),
        }
    }
}

/// A job a worker now owns
#[derive(Debug, Clone)]
pub struct Claim {
    pub job: Job,
    pub item: LeasedItem,
}

impl Claim {
    pub fn job_id(&self) -> Uuid {
        self.job.id
    }
}

/// Outcome of one orphan sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub recovered: Vec<Uuid>,
    pub quarantined: Vec<Uuid>,
}

/// Job counts and queue depth for the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub jobs: BTreeMap<String, i64>,
    pub queue: QueueDepth,
}

pub struct Orchestrator {
    pool: SqlitePool,
    queue: Arc<dyn WorkQueue>,
    events: EventBus,
    settings: OrchestratorSettings,
    /// Cancellation tokens of jobs currently running on this process
    running: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        queue: Arc<dyn WorkQueue>,
        events: EventBus,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            queue,
            events,
            settings,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    async fn with_transport_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, QueueError>>,
    {
        retry_with_backoff(operation, self.settings.max_retry_wait, QueueError::is_transient, f).await
    }

    /// Write a `queued` record and enqueue its work item.
    ///
    /// When the enqueue still fails after transport retries, the record is marked `failed`
    /// with `failed to enqueue: …` and the error is returned.
    pub async fn submit(&self, submission: JobSubmission) -> OrchestratorResult<Job> {
        submission.validate()?;
        if let Some(genre) = submission.genre.as_deref() {
            ReferenceProfile::genre(genre)
                .map_err(|e| mixscope_common::Error::InvalidInput(e.to_string()))?;
        }

        let job = Job::new(submission);
        jobs::insert_job(&self.pool, &job).await?;
        // Published before the enqueue so it always precedes JobStarted
        self.events.emit_lossy(JobEvent::JobQueued {
            job_id: job.id,
            timestamp: Utc::now(),
        });

        let payload = serde_json::json!({ "job_id": job.id, "mode": job.mode });
        let enqueued = self
            .with_transport_retry("enqueue", || self.queue.enqueue(job.id, &payload))
            .await;

        if let Err(err) = enqueued {
            let message = format!("failed to enqueue: {}", err);
            error!(job_id = %job.id, error = %err, "Enqueue failed, marking job failed");
            jobs::finish_job(&self.pool, job.id, JobStatus::Failed, &message).await?;
            self.events.emit_lossy(JobEvent::JobFinished {
                job_id: job.id,
                status: JobStatus::Failed.to_string(),
                error: Some(message),
                timestamp: Utc::now(),
            });
            return Err(OrchestratorError::Enqueue(err));
        }

        info!(job_id = %job.id, mode = %job.mode, input = %job.input_ref, "Job submitted");
        Ok(job)
    }

    /// Dequeue the next claimable job and move it to `processing`.
    ///
    /// Items for terminal jobs are acked and skipped. Items for jobs another worker is
    /// still processing are pushed back by one lease.
    pub async fn claim(&self, worker: usize) -> OrchestratorResult<Option<Claim>> {
        for _ in 0..MAX_SKIPS_PER_CLAIM {
            let lease = self.settings.lease;
            let Some(item) = self
                .with_transport_retry("dequeue", || self.queue.dequeue(lease))
                .await?
            else {
                return Ok(None);
            };

            let Some(job) = jobs::get_job(&self.pool, item.job_id).await? else {
                warn!(job_id = %item.job_id, "Work item without job record, dropping");
                self.queue.ack(&item).await?;
                continue;
            };

            match job.status {
                status if status.is_terminal() => {
                    debug!(job_id = %job.id, %status, deliveries = item.deliveries, "Redelivered terminal job, skipping");
                    self.queue.ack(&item).await?;
                }
                JobStatus::Processing => {
                    debug!(job_id = %job.id, "Job still processing elsewhere, deferring");
                    self.queue.nack(&item, self.settings.lease).await?;
                }
                _ => {
                    if !jobs::mark_processing(&self.pool, job.id).await? {
                        self.queue.nack(&item, Duration::ZERO).await?;
                        continue;
                    }
                    let job = jobs::get_job(&self.pool, job.id)
                        .await?
                        .ok_or(OrchestratorError::NotFound(job.id))?;

                    info!(job_id = %job.id, worker, delivery = item.deliveries, "Job claimed");
                    self.events.emit_lossy(JobEvent::JobStarted {
                        job_id: job.id,
                        worker,
                        timestamp: Utc::now(),
                    });
                    return Ok(Some(Claim { job, item }));
                }
            }
        }
        Ok(None)
    }

    /// Refresh the heartbeat and the queue lease. `false` once the lease is lost.
    pub async fn heartbeat(&self, claim: &Claim) -> OrchestratorResult<bool> {
        jobs::touch_heartbeat(&self.pool, claim.job_id()).await?;
        let held = self
            .with_transport_retry("heartbeat", || self.queue.heartbeat(&claim.item, self.settings.lease))
            .await?;
        if !held {
            warn!(job_id = %claim.job_id(), "Lease lost; job may be redelivered");
        }
        Ok(held)
    }

    /// Progress sink that persists and publishes progress for `job_id`
    pub fn progress_sink(&self, job_id: Uuid) -> JobProgress {
        JobProgress {
            pool: self.pool.clone(),
            events: self.events.clone(),
            job_id,
        }
    }

    /// `processing → completed`, then ack
    pub async fn complete(&self, claim: &Claim, result: &AnalysisResult) -> OrchestratorResult<bool> {
        let value = serde_json::to_value(result).map_err(mixscope_common::Error::from)?;
        let written = jobs::complete_job(&self.pool, claim.job_id(), &value).await?;

        if written {
            info!(
                job_id = %claim.job_id(),
                score = ?result.scoring.as_ref().and_then(|s| s.score_pct),
                "Job completed"
            );
            self.events.emit_lossy(JobEvent::JobProgress {
                job_id: claim.job_id(),
                progress_pct: 100,
                message: "completed".to_string(),
                timestamp: Utc::now(),
            });
            self.events.emit_lossy(JobEvent::JobFinished {
                job_id: claim.job_id(),
                status: JobStatus::Completed.to_string(),
                error: None,
                timestamp: Utc::now(),
            });
        } else {
            warn!(job_id = %claim.job_id(), "Job left processing before completion; result discarded");
        }

        self.ack(claim).await?;
        Ok(written)
    }

    /// Terminal failure (`failed` or `error`), then ack
    pub async fn fail(&self, claim: &Claim, status: JobStatus, reason: &str) -> OrchestratorResult<bool> {
        let written = jobs::finish_job(&self.pool, claim.job_id(), status, reason).await?;

        if written {
            if status == JobStatus::Error {
                error!(job_id = %claim.job_id(), reason, "Job errored");
            } else {
                warn!(job_id = %claim.job_id(), %status, reason, "Job failed");
            }
            self.events.emit_lossy(JobEvent::JobFinished {
                job_id: claim.job_id(),
                status: status.to_string(),
                error: Some(reason.to_string()),
                timestamp: Utc::now(),
            });
        }

        self.ack(claim).await?;
        Ok(written)
    }

    /// Ack without a status change (the job was cancelled while running)
    pub async fn release(&self, claim: &Claim) -> OrchestratorResult<()> {
        self.ack(claim).await
    }

    async fn ack(&self, claim: &Claim) -> OrchestratorResult<()> {
        let acked = self
            .with_transport_retry("ack", || self.queue.ack(&claim.item))
            .await?;
        if !acked {
            debug!(job_id = %claim.job_id(), "Ack ignored: lease no longer held");
        }
        Ok(())
    }

    /// Return stale `processing` jobs to the queue, or quarantine them as `error` once they
    /// have been recovered `max_recoveries` times.
    pub async fn recover_orphans(&self) -> OrchestratorResult<RecoveryReport> {
        let threshold = chrono::Duration::from_std(self.settings.orphan_threshold)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - threshold;
        let max = self.settings.max_recoveries;
        let mut report = RecoveryReport::default();

        for job in jobs::find_orphans(&self.pool, cutoff).await? {
            if job.recovery_count >= max {
                let note = format!(
                    "quarantined: orphaned {} times, giving up (poison input?)",
                    job.recovery_count + 1
                );
                if jobs::finish_job(&self.pool, job.id, JobStatus::Error, &note).await? {
                    error!(job_id = %job.id, recovery_count = job.recovery_count, "Job quarantined after repeated orphaned leases");
                    self.events.emit_lossy(JobEvent::JobFinished {
                        job_id: job.id,
                        status: JobStatus::Error.to_string(),
                        error: Some(note),
                        timestamp: Utc::now(),
                    });
                    report.quarantined.push(job.id);
                }
                continue;
            }

            let attempt = job.recovery_count + 1;
            let note = format!("recovered from orphaned lease (attempt {}/{})", attempt, max);
            if !jobs::requeue_orphan(&self.pool, job.id, job.recovery_count, &note).await? {
                continue;
            }

            warn!(
                job_id = %job.id,
                attempt,
                max_recoveries = max,
                last_heartbeat = ?job.heartbeat_at,
                "Recovered orphaned job"
            );
            let payload = serde_json::json!({ "job_id": job.id, "mode": job.mode });
            if let Err(err) = self
                .with_transport_retry("enqueue", || self.queue.enqueue(job.id, &payload))
                .await
            {
                // The original item is still in the queue and will be redelivered
                warn!(job_id = %job.id, error = %err, "Re-enqueue after recovery failed");
            }
            self.events.emit_lossy(JobEvent::JobRecovered {
                job_id: job.id,
                recovery_count: attempt,
                timestamp: Utc::now(),
            });
            report.recovered.push(job.id);
        }

        Ok(report)
    }

    /// Cancel a queued or processing job. A running job is signalled through its token.
    pub async fn cancel(&self, job_id: Uuid) -> OrchestratorResult<Job> {
        let job = self.status(job_id).await?;
        if job.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal {
                id: job_id,
                status: job.status,
            });
        }

        if !jobs::finish_job(&self.pool, job_id, JobStatus::Cancelled, "cancelled by request").await? {
            // Raced with a terminal transition
            let job = self.status(job_id).await?;
            return Err(OrchestratorError::AlreadyTerminal {
                id: job_id,
                status: job.status,
            });
        }

        if let Some(token) = self.running.read().await.get(&job_id) {
            token.cancel();
        }

        info!(job_id = %job_id, "Job cancelled");
        self.events.emit_lossy(JobEvent::JobFinished {
            job_id,
            status: JobStatus::Cancelled.to_string(),
            error: Some("cancelled by request".to_string()),
            timestamp: Utc::now(),
        });
        self.status(job_id).await
    }

    pub async fn status(&self, job_id: Uuid) -> OrchestratorResult<Job> {
        jobs::get_job(&self.pool, job_id)
            .await?
            .ok_or(OrchestratorError::NotFound(job_id))
    }

    pub async fn stats(&self) -> OrchestratorResult<QueueStats> {
        Ok(QueueStats {
            jobs: jobs::count_by_status(&self.pool).await?,
            queue: self.queue.depth().await?,
        })
    }

    /// Register a running job; the token fires on [`cancel`](Self::cancel)
    pub async fn register_running(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.running.write().await.insert(job_id, token.clone());
        token
    }

    pub async fn unregister_running(&self, job_id: Uuid) {
        self.running.write().await.remove(&job_id);
    }
}

/// [`ProgressSink`] writing to the job record and the event bus
pub struct JobProgress {
    pool: SqlitePool,
    events: EventBus,
    job_id: Uuid,
}

#[async_trait::async_trait]
impl ProgressSink for JobProgress {
    async fn report(&self, pct: u8, message: &str) {
        match jobs::update_progress(&self.pool, self.job_id, pct, message).await {
            Ok(true) => {
                self.events.emit_lossy(JobEvent::JobProgress {
                    job_id: self.job_id,
                    progress_pct: pct,
                    message: message.to_string(),
                    timestamp: Utc::now(),
                });
            }
            Ok(false) => debug!(job_id = %self.job_id, pct, "Progress ignored: job not processing"),
            Err(e) => warn!(job_id = %self.job_id, error = %e, "Failed to record progress"),
        }
    }
}
