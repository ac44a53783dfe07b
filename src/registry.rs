// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// In-memory worker membership and the model -> serving-nodes index.
// One mutex covers nodes, index and round-robin cursors so selection
// stays fair under concurrent registration.

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A registered worker node as the operator sees it.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: String,
    pub url: String,
    pub models: Vec<String>,
    pub payout_address: Option<String>,
    pub last_seen: Instant,
}

/// Wire shape for `/nodes`; `last_seen` is reported as an age in seconds.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub url: String,
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_address: Option<String>,
    pub last_seen_secs: u64,
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        NodeInfo {
            node_id: node.node_id.clone(),
            url: node.url.clone(),
            models: node.models.clone(),
            payout_address: node.payout_address.clone(),
            last_seen_secs: node.last_seen.elapsed().as_secs(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    nodes: HashMap<String, Node>,
    /// model name -> node ids serving it, in registration order.
    model_index: HashMap<String, Vec<String>>,
    /// model name -> round-robin cursor into `model_index`.
    cursors: HashMap<String, usize>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a node. Any prior record for the same id is replaced and its
    /// old index entries removed first, so re-registration never duplicates.
    pub async fn register(
        &self,
        node_id: &str,
        url: &str,
        models: Vec<String>,
        payout_address: Option<String>,
    ) -> Node {
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.nodes.remove(node_id) {
            for model in &old.models {
                if let Some(ids) = inner.model_index.get_mut(model) {
                    ids.retain(|id| id != node_id);
                }
            }
            debug!("replacing registration for node {}", node_id);
        }

        let node = Node {
            node_id: node_id.to_string(),
            url: url.to_string(),
            models,
            payout_address,
            last_seen: Instant::now(),
        };
        for model in &node.models {
            inner
                .model_index
                .entry(model.clone())
                .or_default()
                .push(node_id.to_string());
        }
        inner.nodes.insert(node_id.to_string(), node.clone());
        info!(
            "registered node {} serving [{}]",
            node_id,
            node.models.join(", ")
        );
        node
    }

    /// Fair round-robin selection over the live nodes for `model`. The
    /// cursor advances under the same lock as the membership read, so N
    /// consecutive picks over a stable set visit each node exactly once.
    pub async fn pick(&self, model: &str) -> Option<Node> {
        let mut guard = self.inner.lock().await;
        let RegistryInner {
            nodes,
            model_index,
            cursors,
        } = &mut *guard;
        let ids = model_index.get(model)?;
        if ids.is_empty() {
            return None;
        }
        let cursor = cursors.entry(model.to_string()).or_insert(0);
        let idx = *cursor % ids.len();
        *cursor = (idx + 1) % ids.len();
        nodes.get(&ids[idx]).cloned()
    }

    /// Ids of all live nodes serving `model`, in registration order.
    pub async fn nodes_for_model(&self, model: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.model_index.get(model).cloned().unwrap_or_default()
    }

    pub async fn get(&self, node_id: &str) -> Option<Node> {
        let inner = self.inner.lock().await;
        inner.nodes.get(node_id).cloned()
    }

    /// Snapshot of all registered nodes.
    pub async fn list(&self) -> Vec<Node> {
        let inner = self.inner.lock().await;
        inner.nodes.values().cloned().collect()
    }

    /// Sorted union of every advertised model.
    pub async fn models(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut models: Vec<String> = inner
            .model_index
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(model, _)| model.clone())
            .collect();
        models.sort();
        models
    }

    /// Refresh `last_seen`. No-op when the node is not registered.
    pub async fn heartbeat(&self, node_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.nodes.get_mut(node_id) {
            Some(node) => {
                node.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove every node silent for longer than `max_age`, together with
    /// its index entries. Returns the pruned ids.
    pub async fn prune(&self, max_age: Duration) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let stale: Vec<String> = inner
            .nodes
            .values()
            .filter(|n| now.duration_since(n.last_seen) > max_age)
            .map(|n| n.node_id.clone())
            .collect();
        for node_id in &stale {
            if let Some(node) = inner.nodes.remove(node_id) {
                for model in &node.models {
                    if let Some(ids) = inner.model_index.get_mut(model) {
                        ids.retain(|id| id != node_id);
                    }
                }
                info!("pruned stale node {}", node_id);
            }
        }
        inner.model_index.retain(|_, ids| !ids.is_empty());
        stale
    }
}
