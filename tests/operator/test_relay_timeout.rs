// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Relay deadline behavior: a worker that accepts a job but never posts
//! chunks leaves the requester with a single terminal timeout line, the
//! runtime entry intact, and a late `done` still lands in the ledger.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use fabstir_llm_operator::{
    config::OperatorConfig, create_router, Ledger, OperatorState, JOB_ID_HEADER,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tower::util::ServiceExt;

async fn setup() -> (Arc<OperatorState>, Router, NamedTempFile) {
    let tmp = NamedTempFile::new().unwrap();
    let ledger = Ledger::open(tmp.path().to_str().unwrap()).await.unwrap();
    let mut config = OperatorConfig::default();
    config.stream_check_interval_ms = 10;
    // Shrink the deadline so the scenario fits in a test
    config.max_job_timeout = 1;
    let state = Arc::new(OperatorState::new(config, ledger));
    let app = create_router(state.clone());
    (state, app, tmp)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_silent_worker_yields_timeout_chunk_then_late_done_is_accepted() {
    let (state, app, _tmp) = setup().await;

    app.clone()
        .oneshot(post_json(
            "/register",
            json!({"node_id": "w1", "url": "http://w1:8001", "models": ["llama3"]}),
        ))
        .await
        .unwrap();

    // Job is queued; nobody ever polls it or posts chunks
    let response = app
        .clone()
        .oneshot(post_json(
            "/inference",
            json!({"model": "llama3", "prompt": "2+2"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job_id = response
        .headers()
        .get(JOB_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let body = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("relay must close at the deadline")
    .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert_eq!(text, "{\"error\":\"Job timeout\",\"done\":true}\n");

    // The runtime entry survives the timeout
    assert!(state.queue.drain_since(&job_id, 0).await.is_some());

    // A late done from the worker still completes the job in the ledger
    let response = app
        .clone()
        .oneshot(post_json(&format!("/jobs/{}/done", job_id), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/jobs/{}", job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let record: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(record["status"], "completed");
}

#[tokio::test]
async fn test_worker_reported_error_reaches_requester_and_ledger() {
    let (_state, app, _tmp) = setup().await;

    app.clone()
        .oneshot(post_json(
            "/register",
            json!({"node_id": "w1", "url": "http://w1:8001", "models": ["llama3"]}),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/inference",
            json!({"model": "llama3", "prompt": "2+2"}),
        ))
        .await
        .unwrap();
    let job_id = response
        .headers()
        .get(JOB_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Worker gives up immediately
    let done_app = app.clone();
    let done_job = job_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        done_app
            .oneshot(post_json(
                &format!("/jobs/{}/done?error=model%20crashed", done_job),
                json!({}),
            ))
            .await
            .unwrap();
    });

    let body = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("stream should terminate on failure")
    .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let last: Value = serde_json::from_str(text.lines().last().unwrap()).unwrap();
    assert_eq!(last["error"], "model crashed");
    assert_eq!(last["done"], true);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/jobs/{}", job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let record: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(record["status"], "failed");
}
