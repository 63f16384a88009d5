//! Job lifecycle events
//!
//! The orchestrator publishes a [`JobEvent`] for every status change; HTTP clients
//! subscribe through the SSE endpoint instead of polling the job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Job lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// Job record written; the work item is enqueued right after
    JobQueued {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A worker claimed the job
    JobStarted {
        job_id: Uuid,
        worker: usize,
        timestamp: DateTime<Utc>,
    },

    /// Pipeline stage progress
    JobProgress {
        job_id: Uuid,
        progress_pct: u8,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Orphan sweep returned the job to the queue
    JobRecovered {
        job_id: Uuid,
        recovery_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// Terminal status reached (`completed`, `failed`, `error` or `cancelled`)
    JobFinished {
        job_id: Uuid,
        status: String,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::JobQueued { job_id, .. }
            | JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobProgress { job_id, .. }
            | JobEvent::JobRecovered { job_id, .. }
            | JobEvent::JobFinished { job_id, .. } => *job_id,
        }
    }

    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::JobQueued { .. } => "JobQueued",
            JobEvent::JobStarted { .. } => "JobStarted",
            JobEvent::JobProgress { .. } => "JobProgress",
            JobEvent::JobRecovered { .. } => "JobRecovered",
            JobEvent::JobFinished { .. } => "JobFinished",
        }
    }
}

/// Broadcast bus for [`JobEvent`]s
///
/// Cloning is cheap; all clones share one channel. Slow subscribers lose the oldest
/// events once `capacity` is exceeded.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    ///
    /// ```
    /// use mixscope_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.capacity(), 100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; fails when nobody is subscribed
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: JobEvent) -> Result<usize, broadcast::error::SendError<JobEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case
    pub fn emit_lossy(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
