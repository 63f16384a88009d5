//! Database access for mixscope-analyzer
//!
//! One SQLite file holds the job records and the work queue. Timestamps are stored as
//! RFC 3339 text with millisecond precision and a `Z` suffix, so string comparison orders
//! them chronologically.

pub mod jobs;

use chrono::{DateTime, SecondsFormat, Utc};
use mixscope_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Total time a write keeps retrying while the database is locked
pub const MAX_LOCK_WAIT_MS: u64 = 5000;

const BUSY_TIMEOUT_MS: u64 = 250;
const MAX_CONNECTIONS: u32 = 8;

/// Open (or create) the database at `db_path` and ensure the tables exist
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_millis(MAX_LOCK_WAIT_MS))
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create the `jobs` and `work_queue` tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            input_ref TEXT NOT NULL,
            reference_ref TEXT,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            progress_pct INTEGER NOT NULL DEFAULT 0,
            progress_message TEXT,
            result TEXT,
            error TEXT,
            display_name TEXT,
            genre TEXT,
            previous_job_id TEXT,
            heartbeat_at TEXT,
            recovery_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;

    // One row per job: redelivery reuses the row, so a job is never queued twice
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_queue (
            item_id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL UNIQUE,
            payload TEXT NOT NULL,
            visible_at TEXT NOT NULL,
            lease_token TEXT,
            deliveries INTEGER NOT NULL DEFAULT 0,
            enqueued_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_work_queue_visible ON work_queue(visible_at)")
        .execute(pool)
        .await?;

    tracing::info!("Database tables initialized (jobs, work_queue)");

    Ok(())
}

/// Stored form of a timestamp
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

pub fn parse_ts(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    // A single connection: every in-memory connection is its own database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_tables(&pool).await.unwrap();
    pool
}
