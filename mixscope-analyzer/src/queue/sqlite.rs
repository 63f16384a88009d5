//! `work_queue` table implementation of [`WorkQueue`]

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use super::{LeasedItem, QueueDepth, QueueError, WorkQueue};
use crate::db::{format_ts, now_ts, parse_ts};

#[derive(Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn transport(err: sqlx::Error) -> QueueError {
    QueueError::Transport(err.to_string())
}

/// Stored timestamp `duration` from now
fn after(duration: Duration) -> String {
    let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500));
    format_ts(Utc::now() + delta)
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, QueueError> {
    Uuid::parse_str(value).map_err(|e| {
        QueueError::Store(mixscope_common::Error::Internal(format!(
            "Failed to parse {}: {}",
            field, e
        )))
    })
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn enqueue(&self, job_id: Uuid, payload: &serde_json::Value) -> Result<(), QueueError> {
        let payload = serde_json::to_string(payload).map_err(mixscope_common::Error::from)?;
        let now = now_ts();

        sqlx::query(
            r#"
            INSERT INTO work_queue (item_id, job_id, payload, visible_at, lease_token, deliveries, enqueued_at)
            VALUES (?, ?, ?, ?, NULL, 0, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                payload = excluded.payload,
                visible_at = excluded.visible_at,
                lease_token = NULL
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job_id.to_string())
        .bind(&payload)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(transport)?;

        tracing::debug!(job_id = %job_id, "Work item enqueued");
        Ok(())
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<LeasedItem>, QueueError> {
        let now = now_ts();
        let expires = after(lease);
        let token = Uuid::new_v4();

        // Single statement: SQLite serializes writers, so two workers never claim one item
        let row = sqlx::query(
            r#"
            UPDATE work_queue
            SET visible_at = ?, lease_token = ?, deliveries = deliveries + 1
            WHERE item_id = (
                SELECT item_id FROM work_queue
                WHERE visible_at <= ?
                ORDER BY enqueued_at, item_id
                LIMIT 1
            )
            RETURNING item_id, job_id, payload, deliveries, visible_at
            "#,
        )
        .bind(&expires)
        .bind(token.to_string())
        .bind(&now)
        .fetch_optional(&self.pool)
        .await
        .map_err(transport)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let item_id: String = row.get("item_id");
        let job_id: String = row.get("job_id");
        let payload: String = row.get("payload");
        let visible_at: String = row.get("visible_at");
        let payload = serde_json::from_str(&payload).map_err(mixscope_common::Error::from)?;

        Ok(Some(LeasedItem {
            item_id: parse_uuid("item_id", &item_id)?,
            job_id: parse_uuid("job_id", &job_id)?,
            payload,
            lease_token: token,
            deliveries: row.get::<i64, _>("deliveries").max(0) as u32,
            lease_expires_at: parse_ts("visible_at", &visible_at)?,
        }))
    }

    async fn heartbeat(&self, item: &LeasedItem, extension: Duration) -> Result<bool, QueueError> {
        let done = sqlx::query(
            "UPDATE work_queue SET visible_at = ? WHERE item_id = ? AND lease_token = ?",
        )
        .bind(after(extension))
        .bind(item.item_id.to_string())
        .bind(item.lease_token.to_string())
        .execute(&self.pool)
        .await
        .map_err(transport)?;
        Ok(done.rows_affected() == 1)
    }

    async fn ack(&self, item: &LeasedItem) -> Result<bool, QueueError> {
        let done = sqlx::query("DELETE FROM work_queue WHERE item_id = ? AND lease_token = ?")
            .bind(item.item_id.to_string())
            .bind(item.lease_token.to_string())
            .execute(&self.pool)
            .await
            .map_err(transport)?;
        Ok(done.rows_affected() == 1)
    }

    async fn nack(&self, item: &LeasedItem, delay: Duration) -> Result<bool, QueueError> {
        let done = sqlx::query(
            r#"
            UPDATE work_queue SET visible_at = ?, lease_token = NULL
            WHERE item_id = ? AND lease_token = ?
            "#,
        )
        .bind(after(delay))
        .bind(item.item_id.to_string())
        .bind(item.lease_token.to_string())
        .execute(&self.pool)
        .await
        .map_err(transport)?;
        Ok(done.rows_affected() == 1)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN visible_at <= ? THEN 1 ELSE 0 END), 0) AS ready,
                COUNT(*) AS total
            FROM work_queue
            "#,
        )
        .bind(now_ts())
        .fetch_one(&self.pool)
        .await
        .map_err(transport)?;

        let ready = row.get::<i64, _>("ready").max(0) as u64;
        let total = row.get::<i64, _>("total").max(0) as u64;
        Ok(QueueDepth {
            ready,
            invisible: total.saturating_sub(ready),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_dequeue_is_fifo_and_leased() {
        let queue = SqliteQueue::new(memory_pool().await);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        queue.enqueue(first, &json!({"n": 1})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.enqueue(second, &json!({"n": 2})).await.unwrap();

        let a = queue.dequeue(LEASE).await.unwrap().unwrap();
        let b = queue.dequeue(LEASE).await.unwrap().unwrap();
        assert_eq!(a.job_id, first);
        assert_eq!(a.payload["n"], 1);
        assert_eq!(b.job_id, second);
        assert_eq!(a.deliveries, 1);

        // Both leased: nothing visible
        assert!(queue.dequeue(LEASE).await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), QueueDepth { ready: 0, invisible: 2 });

        assert!(queue.ack(&a).await.unwrap());
        assert!(!queue.ack(&a).await.unwrap());
        assert_eq!(queue.depth().await.unwrap().invisible, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers_with_new_token() {
        let queue = SqliteQueue::new(memory_pool().await);
        let job_id = Uuid::new_v4();
        queue.enqueue(job_id, &json!({})).await.unwrap();

        let stale = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = queue.dequeue(LEASE).await.unwrap().unwrap();

        assert_eq!(fresh.item_id, stale.item_id);
        assert_eq!(fresh.deliveries, 2);
        assert_ne!(fresh.lease_token, stale.lease_token);

        assert!(!queue.heartbeat(&stale, LEASE).await.unwrap());
        assert!(!queue.ack(&stale).await.unwrap());
        assert!(queue.heartbeat(&fresh, LEASE).await.unwrap());
        assert!(queue.ack(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_nack_delays_redelivery() {
        let queue = SqliteQueue::new(memory_pool().await);
        queue.enqueue(Uuid::new_v4(), &json!({})).await.unwrap();

        let item = queue.dequeue(LEASE).await.unwrap().unwrap();
        assert!(queue.nack(&item, Duration::from_secs(30)).await.unwrap());
        assert!(queue.dequeue(LEASE).await.unwrap().is_none());

        sqlx::query("UPDATE work_queue SET visible_at = ?")
            .bind(now_ts())
            .execute(&queue.pool)
            .await
            .unwrap();
        let item = queue.dequeue(LEASE).await.unwrap().unwrap();
        assert!(queue.nack(&item, Duration::ZERO).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.dequeue(LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reenqueue_replaces_item_and_revokes_lease() {
        let queue = SqliteQueue::new(memory_pool().await);
        let job_id = Uuid::new_v4();
        queue.enqueue(job_id, &json!({"v": 1})).await.unwrap();
        let held = queue.dequeue(LEASE).await.unwrap().unwrap();

        queue.enqueue(job_id, &json!({"v": 2})).await.unwrap();
        assert!(!queue.ack(&held).await.unwrap());

        let again = queue.dequeue(LEASE).await.unwrap().unwrap();
        assert_eq!(again.job_id, job_id);
        assert_eq!(again.payload["v"], 2);
        assert_eq!(queue.depth().await.unwrap(), QueueDepth { ready: 0, invisible: 1 });
    }
}
