//! HTTP Server & Routing Integration Tests
//!
//! Requests go through the full router with `tower::ServiceExt::oneshot`; no workers run,
//! so submitted jobs stay `queued` unless a test claims them.

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use helpers::{create_test_db, create_test_orchestrator, test_settings};
use http_body_util::BodyExt;
use mixscope_analyzer::services::Orchestrator;
use mixscope_analyzer::{build_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

async fn test_app() -> (TempDir, Arc<Orchestrator>, Router) {
    let (dir, pool) = create_test_db().await.unwrap();
    let orchestrator = create_test_orchestrator(&pool, test_settings());
    let app = build_router(AppState::new(Arc::clone(&orchestrator)));
    (dir, orchestrator, app)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// TC-HTTP-001: Health reports identity, counts and queue depth
#[tokio::test]
async fn tc_http_001_health_check() {
    // Given: a fresh service
    let (_dir, _orch, app) = test_app().await;

    // When: GET /health
    let (status, body) = send(&app, get("/health")).await;

    // Then: 200 with module identity and zeroed counts
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "mixscope-analyzer");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["jobs"]["queued"], 0);
    assert_eq!(body["jobs"]["completed"], 0);
    assert_eq!(body["queue"]["ready"], 0);
    assert!(body.get("last_error").is_none());
}

/// TC-HTTP-002: Submit returns 202 and the job is readable
#[tokio::test]
async fn tc_http_002_submit_and_get_job() {
    // Given: a running service
    let (_dir, _orch, app) = test_app().await;

    // When: a genre job is submitted
    let (status, body) = send(
        &app,
        post_json("/jobs", json!({ "input_ref": "/audio/mix.wav", "display_name": "Mix v1" })),
    )
    .await;

    // Then: 202 with the new id, and GET shows it queued
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, view) = send(&app, get(&format!("/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["job_id"], job_id);
    assert_eq!(view["status"], "queued");
    assert_eq!(view["mode"], "genre");
    assert_eq!(view["display_name"], "Mix v1");
    assert_eq!(view["progress_pct"], 0);
    assert!(view.get("result").is_none());

    let (_, health) = send(&app, get("/health")).await;
    assert_eq!(health["jobs"]["queued"], 1);
    assert_eq!(health["queue"]["ready"], 1);
}

/// TC-HTTP-003: Invalid submissions are rejected with 400
#[tokio::test]
async fn tc_http_003_invalid_submissions() {
    let (_dir, _orch, app) = test_app().await;

    let cases = [
        json!({ "input_ref": "  " }),
        json!({ "input_ref": "/audio/mix.wav", "mode": "comparison" }),
        json!({ "input_ref": "/audio/mix.wav", "mode": "reference-compare", "reference_ref": "not-a-uuid" }),
        json!({ "input_ref": "/audio/mix.wav", "genre": "polka-metal" }),
    ];

    for case in cases {
        let (status, body) = send(&app, post_json("/jobs", case.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", case);
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }

    // Unknown mode fails JSON extraction before reaching the orchestrator
    let response = app
        .clone()
        .oneshot(post_json("/jobs", json!({ "input_ref": "/a.wav", "mode": "karaoke" })))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

/// TC-HTTP-004: Unknown job id is 404
#[tokio::test]
async fn tc_http_004_unknown_job_not_found() {
    let (_dir, _orch, app) = test_app().await;

    let (status, body) = send(&app, get(&format!("/jobs/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = send(&app, post_json(&format!("/jobs/{}/cancel", Uuid::new_v4()), json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// TC-HTTP-005: Cancel moves a live job to cancelled; a second cancel conflicts
#[tokio::test]
async fn tc_http_005_cancel_job() {
    // Given: a job claimed by a worker
    let (_dir, orch, app) = test_app().await;
    let (_, body) = send(&app, post_json("/jobs", json!({ "input_ref": "/audio/mix.wav" }))).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();
    let claim = orch.claim(0).await.unwrap().unwrap();
    let token = orch.register_running(claim.job_id()).await;

    // When: it is cancelled
    let (status, view) = send(&app, post_json(&format!("/jobs/{}/cancel", job_id), json!({}))).await;

    // Then: 200 with the new status and the worker's token fired
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "cancelled");
    assert!(token.is_cancelled());

    // And: cancelling again is a conflict
    let (status, body) = send(&app, post_json(&format!("/jobs/{}/cancel", job_id), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
}

/// TC-HTTP-006: Event stream answers with text/event-stream
#[tokio::test]
async fn tc_http_006_event_stream_content_type() {
    let (_dir, _orch, app) = test_app().await;

    let response = app.clone().oneshot(get("/jobs/events")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("text/event-stream"));
}
