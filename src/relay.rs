// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Requester-side streaming: a drain task copies a job's chunk buffer to
// the response body as newline-delimited JSON, in append order, until
// the job terminates or the configured deadline passes.

use crate::api::http_server::OperatorState;
use crate::ledger::JobAccounting;
use crate::queue::JobStatus;
use axum::body::Body;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Capacity of the drain task -> response body channel.
const BODY_CHANNEL_CAPACITY: usize = 64;

/// Terminal line emitted when the relay deadline passes.
fn timeout_line() -> Bytes {
    Bytes::from_static(b"{\"error\":\"Job timeout\",\"done\":true}\n")
}

/// Spawn the drain loop for `job_id` and return the NDJSON response
/// body fed by it. The task snapshots new chunks under the job-table
/// lock and emits them outside it; requester disconnect is noticed via
/// channel closure and releases the task without touching the job.
pub fn ndjson_body(state: Arc<OperatorState>, job_id: String) -> Body {
    let (tx, rx) = mpsc::channel::<Bytes>(BODY_CHANNEL_CAPACITY);
    let tick_period = state.config.stream_check_interval();
    let deadline = Instant::now() + state.config.max_job_timeout();

    tokio::spawn(async move {
        let mut cursor = 0usize;
        let mut ticker = tokio::time::interval(tick_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tx.closed() => {
                    debug!("requester for job {} went away, releasing relay", job_id);
                    return;
                }
            }

            let Some(drained) = state.queue.drain_since(&job_id, cursor).await else {
                // Runtime entry already gone; nothing left to stream.
                return;
            };
            cursor = drained.cursor;

            for chunk in drained.chunks {
                let mut line = BytesMut::with_capacity(chunk.len() + 1);
                line.extend_from_slice(&chunk);
                line.put_u8(b'\n');
                if tx.send(line.freeze()).await.is_err() {
                    return;
                }
            }

            if drained.terminal {
                // Fully drained; the ledger row is what outlives this.
                state.queue.remove(&job_id).await;
                return;
            }

            if Instant::now() >= deadline {
                debug!("job {} hit the relay deadline", job_id);
                let _ = tx.send(timeout_line()).await;
                // The runtime entry stays: a late `done` from the worker
                // is still accepted and recorded.
                return;
            }
        }
    });

    Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
}

/// Accounting found by scanning a finished job's chunk lines: the
/// metadata line names the serving node, the terminal line carries the
/// token counts. The hot path never parses payloads; this runs once at
/// completion.
pub fn scan_chunks(chunks: &[Bytes]) -> JobAccounting {
    let mut accounting = JobAccounting::default();
    for chunk in chunks {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(chunk) else {
            continue;
        };
        if value.get("metadata").and_then(|v| v.as_bool()) == Some(true) {
            if let Some(node_id) = value.get("node_id").and_then(|v| v.as_str()) {
                accounting.node_id = Some(node_id.to_string());
            }
        }
        if let Some(counts) = value.get("token_counts") {
            accounting.prompt_tokens = counts.get("prompt_tokens").and_then(|v| v.as_i64());
            accounting.completion_tokens = counts.get("completion_tokens").and_then(|v| v.as_i64());
            accounting.total_tokens = counts.get("total_tokens").and_then(|v| v.as_i64());
        }
    }
    accounting
}

/// Terminal bookkeeping shared by the done-ingress path: scan the chunk
/// stream, snapshot the serving node's payout address and write the
/// ledger's one-time completion record.
pub async fn finalize_job(
    state: &OperatorState,
    job_id: &str,
    status: JobStatus,
    chunks: &[Bytes],
    assigned_node: Option<String>,
) {
    let mut accounting = scan_chunks(chunks);
    if accounting.node_id.is_none() {
        accounting.node_id = assigned_node;
    }
    if let Some(ref node_id) = accounting.node_id {
        if let Some(node) = state.registry.get(node_id).await {
            accounting.node_payout_address = node.payout_address;
        }
    }
    if let Err(e) = state.ledger.record_completion(job_id, status, &accounting).await {
        warn!("failed to record completion of job {}: {}", job_id, e);
    }
}
