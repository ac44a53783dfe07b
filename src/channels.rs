// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Per-worker bounded push channels. Kept beside the registry, keyed by
// node id, owned by neither: stream teardown never touches registry
// membership, and pruning never closes a channel.
//
// The table is behind a std mutex (critical sections never await) so
// the worker stream's drop guard can deregister synchronously.

use crate::queue::Job;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of each worker's push channel. Overflow is the dispatcher's
/// signal to fall back to the poll queue, not an error.
pub const PUSH_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    JobPush(Job),
    PaymentNotice {
        job_id: String,
        amount: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction_hash: Option<String>,
    },
}

struct Entry {
    generation: u64,
    sender: mpsc::Sender<WorkerMessage>,
}

#[derive(Default)]
struct ChannelsInner {
    entries: HashMap<String, Entry>,
    /// model name -> round-robin cursor over the connected subset.
    cursors: HashMap<String, usize>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct PushChannels {
    inner: Arc<Mutex<ChannelsInner>>,
}

impl PushChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh channel for a worker that just opened its stream,
    /// replacing any prior one. The returned generation token scopes
    /// `detach` to this stream, so a reconnect is not torn down by the
    /// stale stream's guard.
    pub fn attach(&self, node_id: &str) -> (mpsc::Receiver<WorkerMessage>, u64) {
        let (tx, rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().expect("channels lock poisoned");
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.entries.insert(
            node_id.to_string(),
            Entry {
                generation,
                sender: tx,
            },
        );
        (rx, generation)
    }

    /// Remove the channel for `node_id`, but only if it still belongs to
    /// the stream identified by `generation`.
    pub fn detach(&self, node_id: &str, generation: u64) {
        let mut inner = self.inner.lock().expect("channels lock poisoned");
        if inner
            .entries
            .get(node_id)
            .is_some_and(|e| e.generation == generation)
        {
            inner.entries.remove(node_id);
            debug!("push channel for node {} removed", node_id);
        }
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        let inner = self.inner.lock().expect("channels lock poisoned");
        inner.entries.contains_key(node_id)
    }

    /// Hand a job to some connected worker among `candidates`, round-robin
    /// per model. Best-effort: a full or closed channel moves selection to
    /// the next candidate. Returns the accepting node id, or None when no
    /// connected worker could take the job.
    pub fn push_job(&self, candidates: &[String], model: &str, job: &Job) -> Option<String> {
        let mut inner = self.inner.lock().expect("channels lock poisoned");
        let connected: Vec<String> = candidates
            .iter()
            .filter(|id| inner.entries.contains_key(*id))
            .cloned()
            .collect();
        if connected.is_empty() {
            return None;
        }

        let start = *inner.cursors.get(model).unwrap_or(&0);
        for offset in 0..connected.len() {
            let idx = (start + offset) % connected.len();
            let node_id = &connected[idx];
            let Some(entry) = inner.entries.get(node_id) else {
                continue;
            };
            match entry.sender.try_send(WorkerMessage::JobPush(job.clone())) {
                Ok(()) => {
                    let accepted = node_id.clone();
                    inner
                        .cursors
                        .insert(model.to_string(), (idx + 1) % connected.len());
                    return Some(accepted);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("push channel for node {} full, trying next", node_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    let dead = node_id.clone();
                    inner.entries.remove(&dead);
                }
            }
        }
        None
    }

    /// Informational payment callback to a single worker. Best-effort.
    pub fn notify(&self, node_id: &str, message: WorkerMessage) -> bool {
        let inner = self.inner.lock().expect("channels lock poisoned");
        match inner.entries.get(node_id) {
            Some(entry) => entry.sender.try_send(message).is_ok(),
            None => false,
        }
    }
}
