//! Lease-based work queue
//!
//! At-least-once delivery: a dequeued item stays invisible for the lease duration and
//! reappears unless it is acked. Every lease carries a fresh token; operations presented
//! with a stale token (the lease expired and the item was redelivered) return `Ok(false)`.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use sqlite::SqliteQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Retryable I/O failure talking to the queue
    #[error("queue transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Store(#[from] mixscope_common::Error),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transport(_))
    }
}

/// A claimed work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedItem {
    pub item_id: Uuid,
    pub job_id: Uuid,
    pub payload: serde_json::Value,
    pub lease_token: Uuid,
    /// Times this item has been handed out, this delivery included
    pub deliveries: u32,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Visible now
    pub ready: u64,
    /// Under an unexpired lease or delayed by a nack
    pub invisible: u64,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Make `job_id` visible for delivery. Enqueuing a job that already has an item
    /// replaces it and invalidates any outstanding lease.
    async fn enqueue(&self, job_id: Uuid, payload: &serde_json::Value) -> Result<(), QueueError>;

    /// Claim the oldest visible item for `lease`
    async fn dequeue(&self, lease: Duration) -> Result<Option<LeasedItem>, QueueError>;

    /// Push the lease expiry to now + `extension`
    async fn heartbeat(&self, item: &LeasedItem, extension: Duration) -> Result<bool, QueueError>;

    /// Remove the item from further delivery
    async fn ack(&self, item: &LeasedItem) -> Result<bool, QueueError>;

    /// Release the lease; the item becomes visible again after `delay`
    async fn nack(&self, item: &LeasedItem, delay: Duration) -> Result<bool, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
