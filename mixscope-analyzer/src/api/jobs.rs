//! Job submission, status and cancellation endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobStatus, JobSubmission, JobView};
use crate::{ApiError, ApiResult, AppState};

/// POST /jobs response
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// POST /jobs
///
/// Returns 202 once the job is recorded and enqueued.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(submission): Json<JobSubmission>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let job = state.orchestrator.submit(submission).await.map_err(|e| {
        let err = ApiError::from(e);
        record_error(&state, &err);
        err
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    let job = state.orchestrator.status(job_id).await?;
    Ok(Json(JobView::from(job)))
}

/// POST /jobs/:id/cancel
///
/// 409 when the job already reached a terminal status.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    let job = state.orchestrator.cancel(job_id).await?;
    Ok(Json(JobView::from(job)))
}

fn record_error(state: &AppState, err: &ApiError) {
    if matches!(err, ApiError::Internal(_) | ApiError::Common(_)) {
        if let Ok(mut last) = state.last_error.try_write() {
            *last = Some(err.to_string());
        }
    }
}

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
}
