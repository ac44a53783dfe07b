// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Binds a fresh inference request to exactly one delivery path: an
// instant push over a connected worker's channel, or the per-model FIFO
// for a polling worker.

use crate::api::errors::ApiError;
use crate::api::http_server::OperatorState;
use crate::queue::Job;
use tracing::{info, warn};
use uuid::Uuid;

/// Create and dispatch a job for `model`/`prompt`.
///
/// Ordering matters: capability check first (a request for an unserved
/// model must not leave a ledger row behind), then the ledger row and
/// runtime entry, then push-or-enqueue.
pub async fn submit(state: &OperatorState, model: &str, prompt: &str) -> Result<Job, ApiError> {
    if state.registry.pick(model).await.is_none() {
        return Err(ApiError::NoCapableNode {
            model: model.to_string(),
        });
    }

    let job = Job {
        job_id: Uuid::new_v4().to_string(),
        model: model.to_string(),
        prompt: prompt.to_string(),
    };

    state
        .ledger
        .create_job(&job)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    state.queue.insert(job.clone()).await;

    // Push path: prefer a currently-connected worker. Round-robin over
    // the connected subset; a full channel falls through to the queue.
    let candidates = state.registry.nodes_for_model(model).await;
    match state.channels.push_job(&candidates, model, &job) {
        Some(node_id) => {
            state.queue.mark_in_progress(&job.job_id, Some(&node_id)).await;
            if let Err(e) = state.ledger.mark_running(&job.job_id, Some(&node_id)).await {
                warn!("failed to record dispatch of job {}: {}", job.job_id, e);
            }
            info!("job {} pushed to node {}", job.job_id, node_id);
        }
        None => {
            state.queue.enqueue(&job.job_id).await;
            info!("job {} queued for model {}", job.job_id, model);
        }
    }

    Ok(job)
}
