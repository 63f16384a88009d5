//! Worker pool
//!
//! N long-lived tasks, each pulling one job at a time: claim → run (with a heartbeat task
//! alongside) → complete | fail. Workers stop between jobs once the shutdown token fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mixscope_common::config::WorkerConfig;

use super::orchestrator::{Claim, Orchestrator};
use super::runner::{failure_status, JobRunner};
use crate::pipeline::PipelineError;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            // tokio intervals reject a zero period
            heartbeat_interval: config.heartbeat_interval().max(Duration::from_millis(10)),
        }
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        orchestrator: Arc<Orchestrator>,
        runner: Arc<JobRunner>,
        settings: WorkerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let handles = (0..settings.concurrency)
            .map(|worker| {
                let worker_loop = WorkerLoop {
                    worker,
                    orchestrator: Arc::clone(&orchestrator),
                    runner: Arc::clone(&runner),
                    settings: settings.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker_loop.run())
            })
            .collect();

        info!(workers = settings.concurrency, "Worker pool started");
        Self { handles }
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

struct WorkerLoop {
    worker: usize,
    orchestrator: Arc<Orchestrator>,
    runner: Arc<JobRunner>,
    settings: WorkerSettings,
    shutdown: CancellationToken,
}

impl WorkerLoop {
    async fn run(self) {
        debug!(worker = self.worker, "Worker started");

        while !self.shutdown.is_cancelled() {
            match self.orchestrator.claim(self.worker).await {
                Ok(Some(claim)) => self.process(claim).await,
                Ok(None) => self.idle().await,
                Err(e) => {
                    warn!(worker = self.worker, error = %e, "Claim failed");
                    self.idle().await;
                }
            }
        }

        debug!(worker = self.worker, "Worker stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn process(&self, claim: Claim) {
        let job_id = claim.job_id();
        let cancel = self.orchestrator.register_running(job_id).await;

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.orchestrator),
            claim.clone(),
            self.settings.heartbeat_interval,
            heartbeat_stop.clone(),
        ));

        let progress = self.orchestrator.progress_sink(job_id);
        let outcome = self.runner.run(&claim.job, &progress, &cancel).await;

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!(job_id = %job_id, error = %e, "Heartbeat task ended abnormally");
        }

        let finished = match outcome {
            Ok(result) => self.orchestrator.complete(&claim, &result).await.map(|_| ()),
            Err(PipelineError::Cancelled) => {
                info!(job_id = %job_id, "Run stopped after cancellation");
                self.orchestrator.release(&claim).await
            }
            Err(e) => {
                let status = failure_status(&e);
                self.orchestrator
                    .fail(&claim, status, &e.to_string())
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = finished {
            // The lease will lapse and the item be redelivered
            error!(job_id = %job_id, error = %e, "Failed to record job outcome");
        }
        self.orchestrator.unregister_running(job_id).await;
    }
}

async fn heartbeat_loop(
    orchestrator: Arc<Orchestrator>,
    claim: Claim,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately; the claim itself stamped the heartbeat
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                match orchestrator.heartbeat(&claim).await {
                    Ok(true) => debug!(job_id = %claim.job_id(), "Heartbeat"),
                    Ok(false) => {}
                    Err(e) => warn!(job_id = %claim.job_id(), error = %e, "Heartbeat failed"),
                }
            }
        }
    }
}
