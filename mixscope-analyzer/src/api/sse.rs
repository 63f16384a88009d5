//! Server-Sent Events (SSE) stream of job lifecycle events

use crate::AppState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use mixscope_common::events::JobEvent;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    /// Only forward events for this job
    pub job_id: Option<Uuid>,
}

/// GET /jobs/events - SSE event stream
///
/// Streams JobQueued, JobStarted, JobProgress, JobRecovered and JobFinished.
/// A subscriber that falls behind the bus capacity gets a `lagged` event with the
/// number of dropped events and should re-read job status.
pub async fn job_event_stream(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(job_id = ?filter.job_id, "New SSE client connected to job events");

    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE: client lagged behind event bus");
                    yield Ok(Event::default().event("lagged").data(skipped.to_string()));
                    continue;
                }
                Err(RecvError::Closed) => {
                    debug!("SSE: event bus closed");
                    break;
                }
            };

            if !matches_filter(&filter, &event) {
                continue;
            }

            let event_type = event.event_type();
            match serde_json::to_string(&event) {
                Ok(event_json) => {
                    debug!("SSE: Broadcasting job event: {}", event_type);
                    yield Ok(Event::default().event(event_type).data(event_json));
                }
                Err(e) => {
                    warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

fn matches_filter(filter: &EventFilter, event: &JobEvent) -> bool {
    filter.job_id.map_or(true, |id| event.job_id() == id)
}
