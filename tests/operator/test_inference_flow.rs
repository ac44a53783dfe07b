// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Full request/worker round trip over the HTTP surface:
//! a polling worker takes the queued job, streams chunks back through
//! the ingress endpoints, and the requester sees every line in order
//! while the ledger picks up the accounting.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use fabstir_llm_operator::{
    config::OperatorConfig, create_router, Job, Ledger, OperatorState, JOB_ID_HEADER,
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
    config.max_job_timeout = 10;
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

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

const METADATA_LINE: &str = r#"{"metadata":true,"node_id":"w1","node_url":"http://w1:8001"}"#;
const TOKEN_LINE: &str = r#"{"token":"4","done":false}"#;
const DONE_LINE: &str = r#"{"done":true,"token_counts":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#;

/// Poll until a job is handed out, then stream the canned chunk lines
/// back and mark the job done. Returns the job id it served.
async fn run_worker(app: Router) -> String {
    let job: Job = loop {
        let response = app
            .clone()
            .oneshot(get("/poll?node_id=w1&models=llama3"))
            .await
            .unwrap();
        if response.status() == StatusCode::OK {
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            break serde_json::from_slice(&bytes).unwrap();
        }
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(job.model, "llama3");
    assert_eq!(job.prompt, "2+2");

    for line in [METADATA_LINE, TOKEN_LINE, DONE_LINE] {
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/jobs/{}/chunk", job.job_id),
                json!({ "chunk": line }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(post_json(&format!("/jobs/{}/done", job.job_id), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    job.job_id
}

#[tokio::test]
async fn test_happy_path_streams_chunks_in_order_and_records_ledger() {
    let (_state, app, _tmp) = setup().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/register",
            json!({
                "node_id": "w1",
                "url": "http://w1:8001",
                "models": ["llama3"],
                "payout_address": "addr1"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let worker = tokio::spawn(run_worker(app.clone()));

    let response = app
        .clone()
        .oneshot(post_json(
            "/inference",
            json!({"model": "llama3", "prompt": "2+2"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let header_job_id = response
        .headers()
        .get(JOB_ID_HEADER)
        .expect("X-Job-ID header present")
        .to_str()
        .unwrap()
        .to_string();

    // The body closes once the worker reports done
    let body = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("stream should terminate")
    .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec![METADATA_LINE, TOKEN_LINE, DONE_LINE]);

    let served_job_id = worker.await.unwrap();
    assert_eq!(served_job_id, header_job_id);

    // Ledger accounting extracted from the chunk stream
    let record = read_json(
        app.clone()
            .oneshot(get(&format!("/jobs/{}", header_job_id)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["node_id"], "w1");
    assert_eq!(record["node_payout_address"], "addr1");
    assert_eq!(record["prompt_tokens"], 5);
    assert_eq!(record["completion_tokens"], 1);
    assert_eq!(record["total_tokens"], 6);

    // Derived payment block: 6 tokens at the default price
    let amount = record["payment"]["amount"].as_f64().unwrap();
    assert!((amount - 0.0006).abs() < 1e-9);
    assert_eq!(record["payment"]["recipient_address"], "addr1");
}

#[tokio::test]
async fn test_payment_confirmation_round_trip() {
    let (_state, app, _tmp) = setup().await;

    app.clone()
        .oneshot(post_json(
            "/register",
            json!({
                "node_id": "w1",
                "url": "http://w1:8001",
                "models": ["llama3"],
                "payout_address": "addr1"
            }),
        ))
        .await
        .unwrap();

    let worker = tokio::spawn(run_worker(app.clone()));
    let response = app
        .clone()
        .oneshot(post_json(
            "/inference",
            json!({"model": "llama3", "prompt": "2+2"}),
        ))
        .await
        .unwrap();
    let _ = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let job_id = worker.await.unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/payment-confirmed",
            json!({
                "job_id": job_id,
                "transaction_hash": "0xabc",
                "amount": 0.0006,
                "some_future_field": true
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "payment_confirmed");

    let record = read_json(
        app.clone()
            .oneshot(get(&format!("/jobs/{}", job_id)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(record["payment"]["transaction_hash"], "0xabc");
    assert!(record["payment"]["paid_at"].is_string());
}

#[tokio::test]
async fn test_payment_confirmation_for_unknown_job_is_404() {
    let (_state, app, _tmp) = setup().await;
    let response = app
        .oneshot(post_json(
            "/payment-confirmed",
            json!({"job_id": "ghost", "amount": 1.0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chunk_and_done_for_unknown_job_are_dropped_silently() {
    let (_state, app, _tmp) = setup().await;

    let response = app
        .clone()
        .oneshot(post_json("/jobs/ghost/chunk", json!({"chunk": "{}"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post_json("/jobs/ghost/done", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
