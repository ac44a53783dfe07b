// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Registration and discovery surface tests:
//! - /register upserts a node and re-registration never duplicates
//! - /nodes and /models reflect the live registry
//! - /inference for an unserved model is a 404 naming the model
//! - /health answers without any state

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use fabstir_llm_operator::{config::OperatorConfig, create_router, Ledger, OperatorState};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tower::util::ServiceExt;

async fn setup() -> (Arc<OperatorState>, Router, NamedTempFile) {
    let tmp = NamedTempFile::new().unwrap();
    let ledger = Ledger::open(tmp.path().to_str().unwrap()).await.unwrap();
    let state = Arc::new(OperatorState::new(OperatorConfig::default(), ledger));
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

#[tokio::test]
async fn test_register_then_discover() {
    let (_state, app, _tmp) = setup().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/register",
            json!({
                "node_id": "w1",
                "url": "http://w1:8001",
                "models": ["llama3", "mistral"],
                "payout_address": "addr1"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "registered");
    assert_eq!(body["node_id"], "w1");

    let nodes = read_json(app.clone().oneshot(get("/nodes")).await.unwrap()).await;
    let listed = nodes["nodes"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["node_id"], "w1");
    assert_eq!(listed[0]["payout_address"], "addr1");

    let models = read_json(app.clone().oneshot(get("/models")).await.unwrap()).await;
    assert_eq!(models["models"], json!(["llama3", "mistral"]));
}

#[tokio::test]
async fn test_reregistration_replaces_model_set() {
    let (_state, app, _tmp) = setup().await;

    for models in [json!(["a", "b"]), json!(["b", "c"])] {
        let response = app
            .clone()
            .oneshot(post_json(
                "/register",
                json!({"node_id": "w", "url": "http://w:8001", "models": models}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let models = read_json(app.clone().oneshot(get("/models")).await.unwrap()).await;
    assert_eq!(models["models"], json!(["b", "c"]));

    let nodes = read_json(app.clone().oneshot(get("/nodes")).await.unwrap()).await;
    assert_eq!(nodes["nodes"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_register_rejects_blank_node_id() {
    let (_state, app, _tmp) = setup().await;
    let response = app
        .oneshot(post_json(
            "/register",
            json!({"node_id": "  ", "url": "http://w:8001", "models": ["m"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_inference_for_unserved_model_is_404_naming_it() {
    let (_state, app, _tmp) = setup().await;

    let response = app
        .oneshot(post_json(
            "/inference",
            json!({"model": "mystery", "prompt": "2+2"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = read_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("mystery"));
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_state, app, _tmp) = setup().await;
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["status"], "healthy");
}
