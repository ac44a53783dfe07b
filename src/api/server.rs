// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// HTTP surface of the operator. Handlers are free functions over
// State<Arc<OperatorState>>; request-scoped failures become ApiError
// responses, background failures are logged and swallowed.

use anyhow::Result;
use axum::{
    extract::{Json, Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::errors::ApiError;
use super::handlers::{
    ChunkRequest, DoneQuery, HealthResponse, InferenceRequest, ModelsResponse, NodesResponse,
    PaymentConfirmation, RegisterRequest, RegisterResponse, StatusResponse, WorkerQuery,
};
use super::http_server::OperatorState;
use super::worker_stream::stream_handler;
use crate::channels::WorkerMessage;
use crate::registry::NodeInfo;
use crate::{dispatch, relay};

pub const JOB_ID_HEADER: &str = "X-Job-ID";

pub fn create_router(state: Arc<OperatorState>) -> Router {
    Router::new()
        .route("/register", post(register_handler))
        .route("/stream", get(stream_handler))
        .route("/poll", get(poll_handler))
        .route("/jobs/:job_id/chunk", post(chunk_handler))
        .route("/jobs/:job_id/done", post(done_handler))
        .route("/inference", post(inference_handler))
        .route("/jobs/:job_id", get(job_status_handler))
        .route("/payment-confirmed", post(payment_confirmed_handler))
        .route("/nodes", get(nodes_handler))
        .route("/models", get(models_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the router until the shutdown signal fires.
pub async fn serve(
    state: Arc<OperatorState>,
    listener: tokio::net::TcpListener,
    shutdown_rx: oneshot::Receiver<()>,
) -> Result<()> {
    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await?;
    Ok(())
}

async fn register_handler(
    State(state): State<Arc<OperatorState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if request.node_id.trim().is_empty() {
        return Err(ApiError::BadRequest("node_id cannot be empty".to_string()));
    }
    if request.url.trim().is_empty() {
        return Err(ApiError::BadRequest("url cannot be empty".to_string()));
    }

    let node = state
        .registry
        .register(
            &request.node_id,
            &request.url,
            request.models,
            request.payout_address,
        )
        .await;

    Ok(Json(RegisterResponse {
        status: "registered".to_string(),
        node_id: node.node_id,
        models: node.models,
        poll_interval: state.config.poll_interval,
    }))
}

/// Legacy pull path for workers that cannot hold a long-lived stream.
/// Same take() path as push delivery, latency aside.
async fn poll_handler(
    State(state): State<Arc<OperatorState>>,
    Query(query): Query<WorkerQuery>,
) -> Response {
    state.registry.heartbeat(&query.node_id).await;

    let models = query.model_list();
    match state.queue.take(&models, Some(&query.node_id)).await {
        Some(job) => {
            if let Err(e) = state.ledger.mark_running(&job.job_id, Some(&query.node_id)).await {
                warn!("failed to record dispatch of job {}: {}", job.job_id, e);
            }
            info!("job {} taken by polling node {}", job.job_id, query.node_id);
            Json(job).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Chunk ingress (worker -> core): append-only into the job's buffer.
/// Unknown or already-terminal jobs are dropped silently; the operator
/// may have restarted since the job was handed out.
async fn chunk_handler(
    State(state): State<Arc<OperatorState>>,
    Path(job_id): Path<String>,
    Json(request): Json<ChunkRequest>,
) -> Json<StatusResponse> {
    let appended = state
        .queue
        .append_chunk(&job_id, Bytes::from(request.chunk))
        .await;
    if appended {
        if let Some(node_id) = state.queue.assigned_node(&job_id).await {
            state.registry.heartbeat(&node_id).await;
        }
    }
    Json(StatusResponse::new("received"))
}

/// Done ingress: mark the job terminal, then run the one-time completion
/// scan that fills the ledger's accounting columns.
async fn done_handler(
    State(state): State<Arc<OperatorState>>,
    Path(job_id): Path<String>,
    Query(query): Query<DoneQuery>,
) -> Json<StatusResponse> {
    match state.queue.complete(&job_id, query.error).await {
        Some(completed) => {
            relay::finalize_job(
                &state,
                &job_id,
                completed.status,
                &completed.chunks,
                completed.assigned_node,
            )
            .await;
            info!("job {} finished with status {}", job_id, completed.status);
        }
        // Unknown or already terminal: idempotent no-op
        None => {}
    }
    Json(StatusResponse::new("done"))
}

/// Requester entry point: create a job, dispatch it, stream its chunk
/// buffer back as newline-delimited JSON with the job id in a header.
async fn inference_handler(
    State(state): State<Arc<OperatorState>>,
    Json(request): Json<InferenceRequest>,
) -> Result<Response, ApiError> {
    request.validate()?;

    let job = dispatch::submit(&state, &request.model, &request.prompt).await?;
    let body = relay::ndjson_body(state.clone(), job.job_id.clone());

    let mut response = Response::new(body);
    response.headers_mut().insert(
        JOB_ID_HEADER,
        HeaderValue::from_str(&job.job_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?,
    );
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));
    Ok(response)
}

/// Ledger view of a job, with the derived payment block when both the
/// token total and the worker's payout address are known.
async fn job_status_handler(
    State(state): State<Arc<OperatorState>>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .ledger
        .fetch_job(&job_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::UnknownJob(job_id.clone()))?;

    let mut body = serde_json::to_value(&record).map_err(|e| ApiError::Internal(e.to_string()))?;

    if let (Some(total_tokens), Some(recipient)) =
        (record.total_tokens, record.node_payout_address.as_deref())
    {
        let amount = total_tokens as f64 * state.config.pricing.price_per_token;
        let mut payment = serde_json::json!({
            "amount": amount,
            "recipient_address": recipient,
        });
        if let Some(row) = state
            .ledger
            .fetch_payment(&job_id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
        {
            payment["transaction_hash"] = serde_json::json!(row.transaction_hash);
            payment["paid_at"] = serde_json::json!(row.paid_at);
        }
        body["payment"] = payment;
    }

    Ok(Json(body))
}

/// Settlement callback from the requester side. The confirmation is
/// recorded and the serving worker notified, best-effort.
async fn payment_confirmed_handler(
    State(state): State<Arc<OperatorState>>,
    Json(confirmation): Json<PaymentConfirmation>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .ledger
        .fetch_job(&confirmation.job_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::UnknownJob(confirmation.job_id.clone()))?;

    state
        .ledger
        .confirm_payment(
            &confirmation.job_id,
            confirmation.amount,
            confirmation.transaction_hash.as_deref(),
        )
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if let Some(node_id) = record.node_id.as_deref() {
        let delivered = state.channels.notify(
            node_id,
            WorkerMessage::PaymentNotice {
                job_id: confirmation.job_id.clone(),
                amount: confirmation.amount,
                transaction_hash: confirmation.transaction_hash.clone(),
            },
        );
        if !delivered {
            info!(
                "payment notice for job {} not delivered (node {} not streaming)",
                confirmation.job_id, node_id
            );
        }
    }

    Ok(Json(serde_json::json!({
        "status": "payment_confirmed",
        "job_id": confirmation.job_id,
    })))
}

async fn nodes_handler(State(state): State<Arc<OperatorState>>) -> Json<NodesResponse> {
    let nodes = state
        .registry
        .list()
        .await
        .iter()
        .map(NodeInfo::from)
        .collect();
    Json(NodesResponse { nodes })
}

async fn models_handler(State(state): State<Arc<OperatorState>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.registry.models().await,
    })
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}
