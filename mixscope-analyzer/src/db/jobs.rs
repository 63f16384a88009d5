//! Job record persistence
//!
//! Every status change is a conditional `UPDATE ... WHERE status IN (...)` built from the
//! legal predecessors of the target status, so a stale or duplicate writer affects zero
//! rows instead of reverting a terminal job. Functions report whether a row changed.

use chrono::{DateTime, Utc};
use mixscope_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use super::{format_ts, now_ts, parse_ts, MAX_LOCK_WAIT_MS};
use crate::models::job::{AnalysisMode, Job, JobStatus};
use crate::utils::retry_on_lock;

const JOB_COLUMNS: &str = r#"
    id, input_ref, reference_ref, mode, status, progress_pct, progress_message,
    result, error, display_name, genre, previous_job_id, heartbeat_at,
    recovery_count, created_at, updated_at, completed_at
"#;

/// `'a', 'b'` list of the statuses allowed to move to `target`
fn predecessors(target: JobStatus) -> String {
    JobStatus::ALL
        .into_iter()
        .filter(|s| s.can_transition_to(target))
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Insert a new job record
pub async fn insert_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    let id = job.id.to_string();
    let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
    let previous_job_id = job.previous_job_id.map(|id| id.to_string());
    let heartbeat_at = job.heartbeat_at.map(format_ts);
    let created_at = format_ts(job.created_at);
    let updated_at = format_ts(job.updated_at);
    let completed_at = job.completed_at.map(format_ts);

    retry_on_lock("insert_job", MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, input_ref, reference_ref, mode, status, progress_pct, progress_message,
                result, error, display_name, genre, previous_job_id, heartbeat_at,
                recovery_count, created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&job.input_ref)
        .bind(&job.reference_ref)
        .bind(job.mode.as_str())
        .bind(job.status.as_str())
        .bind(job.progress_pct as i64)
        .bind(&job.progress_message)
        .bind(&result)
        .bind(&job.error)
        .bind(&job.display_name)
        .bind(&job.genre)
        .bind(&previous_job_id)
        .bind(&heartbeat_at)
        .bind(job.recovery_count as i64)
        .bind(&created_at)
        .bind(&updated_at)
        .bind(&completed_at)
        .execute(pool)
        .await?;
        Ok::<_, Error>(())
    })
    .await
}

/// Load a job record
pub async fn get_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|row| row_to_job(&row)).transpose()
}

/// `queued → processing`, stamping the first heartbeat
pub async fn mark_processing(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let id = job_id.to_string();
    let now = now_ts();
    let sql = format!(
        r#"
        UPDATE jobs
        SET status = 'processing', heartbeat_at = ?, updated_at = ?,
            progress_pct = 0, progress_message = 'claimed'
        WHERE id = ? AND status IN ({})
        "#,
        predecessors(JobStatus::Processing)
    );

    retry_on_lock("mark_processing", MAX_LOCK_WAIT_MS, || async {
        let done = sqlx::query(&sql)
            .bind(&now)
            .bind(&now)
            .bind(&id)
            .execute(pool)
            .await?;
        Ok::<_, Error>(done.rows_affected() == 1)
    })
    .await
}

/// Refresh the liveness timestamp of a processing job
pub async fn touch_heartbeat(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let id = job_id.to_string();
    let now = now_ts();

    retry_on_lock("touch_heartbeat", MAX_LOCK_WAIT_MS, || async {
        let done = sqlx::query(
            "UPDATE jobs SET heartbeat_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(&now)
        .bind(&id)
        .execute(pool)
        .await?;
        Ok::<_, Error>(done.rows_affected() == 1)
    })
    .await
}

/// Record pipeline progress. Also counts as a heartbeat.
pub async fn update_progress(
    pool: &SqlitePool,
    job_id: Uuid,
    progress_pct: u8,
    message: &str,
) -> Result<bool> {
    let id = job_id.to_string();
    let now = now_ts();
    let pct = progress_pct.min(100) as i64;

    retry_on_lock("update_progress", MAX_LOCK_WAIT_MS, || async {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET progress_pct = ?, progress_message = ?, heartbeat_at = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(pct)
        .bind(message)
        .bind(&now)
        .bind(&now)
        .bind(&id)
        .execute(pool)
        .await?;
        Ok::<_, Error>(done.rows_affected() == 1)
    })
    .await
}

/// `processing → completed` with the serialized result
pub async fn complete_job(pool: &SqlitePool, job_id: Uuid, result: &serde_json::Value) -> Result<bool> {
    let id = job_id.to_string();
    let result = serde_json::to_string(result)?;
    let now = now_ts();
    let sql = format!(
        r#"
        UPDATE jobs
        SET status = 'completed', result = ?, error = NULL, progress_pct = 100,
            progress_message = 'completed', updated_at = ?, completed_at = ?
        WHERE id = ? AND status IN ({})
        "#,
        predecessors(JobStatus::Completed)
    );

    retry_on_lock("complete_job", MAX_LOCK_WAIT_MS, || async {
        let done = sqlx::query(&sql)
            .bind(&result)
            .bind(&now)
            .bind(&now)
            .bind(&id)
            .execute(pool)
            .await?;
        Ok::<_, Error>(done.rows_affected() == 1)
    })
    .await
}

/// Move to a terminal non-success status (`failed`, `error` or `cancelled`) with a reason
pub async fn finish_job(
    pool: &SqlitePool,
    job_id: Uuid,
    status: JobStatus,
    error: &str,
) -> Result<bool> {
    if !status.is_terminal() || status == JobStatus::Completed {
        return Err(Error::InvalidInput(format!(
            "finish_job cannot set status '{}'",
            status
        )));
    }

    let id = job_id.to_string();
    let now = now_ts();
    let sql = format!(
        r#"
        UPDATE jobs
        SET status = ?, error = ?, progress_message = ?, updated_at = ?, completed_at = ?
        WHERE id = ? AND status IN ({})
        "#,
        predecessors(status)
    );

    retry_on_lock("finish_job", MAX_LOCK_WAIT_MS, || async {
        let done = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(error)
            .bind(status.as_str())
            .bind(&now)
            .bind(&now)
            .bind(&id)
            .execute(pool)
            .await?;
        Ok::<_, Error>(done.rows_affected() == 1)
    })
    .await
}

/// `processing → queued` for an orphaned job.
///
/// `seen_recovery_count` must match the stored count; a concurrent sweep that already
/// recovered the job makes this a no-op.
pub async fn requeue_orphan(
    pool: &SqlitePool,
    job_id: Uuid,
    seen_recovery_count: u32,
    note: &str,
) -> Result<bool> {
    let id = job_id.to_string();
    let now = now_ts();

    retry_on_lock("requeue_orphan", MAX_LOCK_WAIT_MS, || async {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', recovery_count = recovery_count + 1, error = ?,
                heartbeat_at = NULL, progress_pct = 0, progress_message = 'requeued',
                updated_at = ?
            WHERE id = ? AND status = 'processing' AND recovery_count = ?
            "#,
        )
        .bind(note)
        .bind(&now)
        .bind(&id)
        .bind(seen_recovery_count as i64)
        .execute(pool)
        .await?;
        Ok::<_, Error>(done.rows_affected() == 1)
    })
    .await
}

/// Processing jobs whose last sign of life is older than `cutoff`
pub async fn find_orphans(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {}
        FROM jobs
        WHERE status = 'processing' AND COALESCE(heartbeat_at, updated_at) < ?
        ORDER BY created_at
        "#,
        JOB_COLUMNS
    ))
    .bind(format_ts(cutoff))
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_job).collect()
}

/// Bucket for rows whose status string no longer parses
pub const UNKNOWN_STATUS: &str = "unknown";

/// Job count per canonical status, every status present. Unparseable rows are logged and
/// counted under [`UNKNOWN_STATUS`].
pub async fn count_by_status(pool: &SqlitePool) -> Result<BTreeMap<String, i64>> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
        .fetch_all(pool)
        .await?;

    let mut counts: BTreeMap<String, i64> = JobStatus::ALL
        .into_iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for row in rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        let key = match JobStatus::from_stored(&status) {
            Ok(parsed) => parsed.as_str().to_string(),
            Err(e) => {
                warn!(status = %status, rows = n, error = %e, "Unrecognized job status in store");
                UNKNOWN_STATUS.to_string()
            }
        };
        *counts.entry(key).or_default() += n;
    }
    Ok(counts)
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let id: String = row.get("id");
    let id = Uuid::parse_str(&id)
        .map_err(|e| Error::Internal(format!("Failed to parse job id '{}': {}", id, e)))?;

    let mode: String = row.get("mode");
    let status: String = row.get("status");

    let result: Option<String> = row.get("result");
    let result = result
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to deserialize result: {}", e)))?;

    let previous_job_id: Option<String> = row.get("previous_job_id");
    let previous_job_id = previous_job_id
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to parse previous_job_id: {}", e)))?;

    let optional_ts = |field: &str| -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = row.get(field);
        value.map(|v| parse_ts(field, &v)).transpose()
    };
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Job {
        id,
        input_ref: row.get("input_ref"),
        reference_ref: row.get("reference_ref"),
        mode: mode.parse::<AnalysisMode>()?,
        status: JobStatus::from_stored(&status)?,
        progress_pct: row.get::<i64, _>("progress_pct").clamp(0, 100) as u8,
        progress_message: row.get("progress_message"),
        result,
        error: row.get("error"),
        display_name: row.get("display_name"),
        genre: row.get("genre"),
        previous_job_id,
        heartbeat_at: optional_ts("heartbeat_at")?,
        recovery_count: row.get::<i64, _>("recovery_count").max(0) as u32,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
        completed_at: optional_ts("completed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::models::job::JobSubmission;
    use serde_json::json;

    async fn queued_job(pool: &SqlitePool) -> Job {
        let mut submission = JobSubmission::new("/tmp/mix.wav", AnalysisMode::Genre);
        submission.display_name = Some("Mix v1".to_string());
        submission.genre = Some("techno".to_string());
        let job = Job::new(submission);
        insert_job(pool, &job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_insert_and_load_round_trip() {
        let pool = memory_pool().await;
        let job = queued_job(&pool).await;

        let loaded = get_job(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.genre.as_deref(), Some("techno"));
        assert!(loaded.result.is_none());
        assert!(get_job(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_transition_applies_once() {
        let pool = memory_pool().await;
        let job = queued_job(&pool).await;

        assert!(mark_processing(&pool, job.id).await.unwrap());
        assert!(!mark_processing(&pool, job.id).await.unwrap());

        let loaded = get_job(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Processing);
        assert!(loaded.heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_status_is_never_overwritten() {
        let pool = memory_pool().await;
        let job = queued_job(&pool).await;
        mark_processing(&pool, job.id).await.unwrap();

        let result = json!({"schema_version": 1, "suggestions": []});
        assert!(complete_job(&pool, job.id, &result).await.unwrap());
        assert!(!finish_job(&pool, job.id, JobStatus::Failed, "late").await.unwrap());
        assert!(!complete_job(&pool, job.id, &json!({})).await.unwrap());
        assert!(!update_progress(&pool, job.id, 50, "late").await.unwrap());

        let loaded = get_job(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.progress_pct, 100);
        // Present-but-empty suggestions survive the round trip
        assert_eq!(loaded.result.unwrap()["suggestions"], json!([]));
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_enqueue_failure_path_and_illegal_finish() {
        let pool = memory_pool().await;
        let job = queued_job(&pool).await;

        // queued → error is not a legal edge
        assert!(!finish_job(&pool, job.id, JobStatus::Error, "nope").await.unwrap());
        assert!(finish_job(&pool, job.id, JobStatus::Failed, "failed to enqueue: down")
            .await
            .unwrap());
        assert!(finish_job(&pool, job.id, JobStatus::Completed, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_orphan_lookup_and_requeue() {
        let pool = memory_pool().await;
        let job = queued_job(&pool).await;
        mark_processing(&pool, job.id).await.unwrap();

        let past = Utc::now() - chrono::Duration::minutes(10);
        assert!(find_orphans(&pool, past).await.unwrap().is_empty());

        let future = Utc::now() + chrono::Duration::seconds(1);
        let orphans = find_orphans(&pool, future).await.unwrap();
        assert_eq!(orphans.len(), 1);

        assert!(requeue_orphan(&pool, job.id, 0, "recovered").await.unwrap());
        // Second sweep with a stale count is a no-op
        assert!(!requeue_orphan(&pool, job.id, 0, "recovered").await.unwrap());

        let loaded = get_job(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.recovery_count, 1);
        assert!(loaded.heartbeat_at.is_none());
        assert_eq!(loaded.error.as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn test_legacy_done_rows_read_as_completed() {
        let pool = memory_pool().await;
        let job = queued_job(&pool).await;
        sqlx::query("UPDATE jobs SET status = 'done' WHERE id = ?")
            .bind(job.id.to_string())
            .execute(&pool)
            .await
            .unwrap();

        let loaded = get_job(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);

        let counts = count_by_status(&pool).await.unwrap();
        assert_eq!(counts["completed"], 1);
        assert_eq!(counts["queued"], 0);
        assert!(!counts.contains_key("done"));
    }

    #[tokio::test]
    async fn test_unrecognized_status_is_counted_not_fatal() {
        let pool = memory_pool().await;
        let good = queued_job(&pool).await;
        let bad = queued_job(&pool).await;
        sqlx::query("UPDATE jobs SET status = 'paused' WHERE id = ?")
            .bind(bad.id.to_string())
            .execute(&pool)
            .await
            .unwrap();

        let counts = count_by_status(&pool).await.unwrap();
        assert_eq!(counts["queued"], 1);
        assert_eq!(counts[UNKNOWN_STATUS], 1);
        assert!(get_job(&pool, good.id).await.unwrap().is_some());
    }
}
