// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Background liveness loop: workers holding an open push channel are
// considered live, silent ones are probed over HTTP, and nodes quiet
// for twice the sweep period are pruned. Probe failures never mutate
// state and never reach user requests.

use crate::api::http_server::OperatorState;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

pub struct LivenessHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl LivenessHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Start the liveness loop. The returned handle stops it on shutdown.
pub fn spawn(state: Arc<OperatorState>) -> Result<LivenessHandle> {
    let client = reqwest::Client::builder()
        .timeout(state.config.health_check_timeout())
        .build()
        .context("failed to build health probe client")?;
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

    let task = tokio::spawn(async move {
        let mut ticker = interval(state.config.health_check_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep(&state, &client).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down liveness loop");
                    break;
                }
            }
        }
    });

    Ok(LivenessHandle { shutdown_tx, task })
}

/// One pass over the registry: refresh or probe every node, then prune.
pub async fn sweep(state: &OperatorState, client: &reqwest::Client) {
    for node in state.registry.list().await {
        if state.channels.is_connected(&node.node_id) {
            state.registry.heartbeat(&node.node_id).await;
            continue;
        }

        let url = format!("{}/health", node.url.trim_end_matches('/'));
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                state.registry.heartbeat(&node.node_id).await;
            }
            Ok(response) => {
                debug!(
                    "health probe for node {} returned {}",
                    node.node_id,
                    response.status()
                );
            }
            Err(e) => {
                debug!("health probe for node {} failed: {}", node.node_id, e);
            }
        }
    }

    state.registry.prune(state.config.prune_max_age()).await;
}
