//! Database Test Utilities

use anyhow::Result;
use mixscope_analyzer::models::{Job, JobStatus};
use mixscope_analyzer::queue::SqliteQueue;
use mixscope_analyzer::services::{Orchestrator, OrchestratorSettings};
use mixscope_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Create a file-backed test database with tables created
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("mixscope.db");
    let pool = mixscope_analyzer::db::init_database_pool(&db_path).await?;
    Ok((temp_dir, pool))
}

/// Short leases and no transport retry wait, for tests that drive recovery by hand
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        lease: Duration::from_secs(30),
        orphan_threshold: Duration::from_secs(60),
        max_recoveries: 3,
        max_retry_wait: Duration::from_millis(50),
    }
}

/// Orchestrator over the SQLite queue sharing `pool`
pub fn create_test_orchestrator(pool: &SqlitePool, settings: OrchestratorSettings) -> Arc<Orchestrator> {
    let queue = Arc::new(SqliteQueue::new(pool.clone()));
    Arc::new(Orchestrator::new(pool.clone(), queue, EventBus::new(256), settings))
}

/// Poll until the job reaches a terminal status or `timeout` elapses
pub async fn wait_for_terminal(orchestrator: &Orchestrator, job_id: Uuid, timeout: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = orchestrator.status(job_id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} still {} after {:?}",
            job_id,
            job.status,
            timeout
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Overwrite heartbeat and update timestamps so the job looks abandoned
pub async fn age_job(pool: &SqlitePool, job_id: Uuid, age: Duration) {
    let stale = chrono::Utc::now() - chrono::Duration::from_std(age).unwrap();
    let ts = mixscope_analyzer::db::format_ts(stale);
    sqlx::query("UPDATE jobs SET heartbeat_at = ?, updated_at = ? WHERE id = ?")
        .bind(&ts)
        .bind(&ts)
        .bind(job_id.to_string())
        .execute(pool)
        .await
        .unwrap();
}

pub fn assert_status(job: &Job, expected: JobStatus) {
    assert_eq!(
        job.status, expected,
        "job {} error: {:?}",
        job.id, job.error
    );
}
