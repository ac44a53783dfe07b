// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// In-memory job state: per-model FIFOs of undispatched jobs plus the
// runtime table holding each job's streamed output buffer. One mutex
// guards both so take/enqueue/append/complete are atomic with respect
// to each other.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tokio::sync::Mutex;

/// One prompt+model unit of work, as handed to workers over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(anyhow::anyhow!("unknown job status '{}'", other)),
        }
    }
}

/// Runtime entry for a job: status, ordered chunk buffer, terminal flag.
#[derive(Debug)]
struct JobRuntime {
    job: Job,
    status: JobStatus,
    chunks: Vec<Bytes>,
    terminal: bool,
    error: Option<String>,
    assigned_node: Option<String>,
    #[allow(dead_code)]
    created_at: Instant,
}

/// Chunks at and after the caller's cursor, plus the advanced cursor and
/// the terminal state, all captured under one lock acquisition.
#[derive(Debug)]
pub struct Drained {
    pub chunks: Vec<Bytes>,
    pub cursor: usize,
    pub terminal: bool,
    pub error: Option<String>,
}

/// Snapshot handed back by `complete` for the one-time ledger update.
#[derive(Debug)]
pub struct CompletedJob {
    pub status: JobStatus,
    pub error: Option<String>,
    pub chunks: Vec<Bytes>,
    pub assigned_node: Option<String>,
}

#[derive(Default)]
struct QueueInner {
    fifos: HashMap<String, VecDeque<String>>,
    jobs: HashMap<String, JobRuntime>,
}

#[derive(Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the runtime entry for a fresh job (status Pending). Does not
    /// enqueue; the dispatcher decides the delivery path.
    pub async fn insert(&self, job: Job) {
        let mut inner = self.inner.lock().await;
        let job_id = job.job_id.clone();
        inner.jobs.insert(
            job_id,
            JobRuntime {
                job,
                status: JobStatus::Pending,
                chunks: Vec::new(),
                terminal: false,
                error: None,
                assigned_node: None,
                created_at: Instant::now(),
            },
        );
    }

    /// Append the job to its model's FIFO for later `take`.
    pub async fn enqueue(&self, job_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(model) = inner.jobs.get(job_id).map(|r| r.job.model.clone()) else {
            return false;
        };
        inner
            .fifos
            .entry(model)
            .or_default()
            .push_back(job_id.to_string());
        true
    }

    /// Scan the caller's model list in order and pop the head of the first
    /// non-empty FIFO, atomically marking the job InProgress for `node_id`.
    pub async fn take(&self, models: &[String], node_id: Option<&str>) -> Option<Job> {
        let mut guard = self.inner.lock().await;
        let QueueInner { fifos, jobs } = &mut *guard;
        for model in models {
            let Some(fifo) = fifos.get_mut(model) else {
                continue;
            };
            while let Some(id) = fifo.pop_front() {
                // Entries whose runtime is gone or already terminal are stale.
                match jobs.get_mut(&id) {
                    Some(runtime) if !runtime.terminal => {
                        if runtime.status == JobStatus::Pending {
                            runtime.status = JobStatus::InProgress;
                        }
                        runtime.assigned_node = node_id.map(String::from);
                        return Some(runtime.job.clone());
                    }
                    _ => continue,
                }
            }
        }
        None
    }

    /// Record that a job was handed directly to a worker over its push
    /// channel. Pending jobs only; terminal state never regresses.
    pub async fn mark_in_progress(&self, job_id: &str, node_id: Option<&str>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(job_id) {
            Some(runtime) if runtime.status == JobStatus::Pending => {
                runtime.status = JobStatus::InProgress;
                runtime.assigned_node = node_id.map(String::from);
                true
            }
            _ => false,
        }
    }

    /// O(1) append of one output line. No-op for unknown or terminal jobs.
    pub async fn append_chunk(&self, job_id: &str, line: Bytes) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(job_id) {
            Some(runtime) if !runtime.terminal => {
                runtime.chunks.push(line);
                true
            }
            _ => false,
        }
    }

    /// Mark the job terminal: Failed iff the worker reported an error,
    /// Completed otherwise. A worker-reported error is propagated verbatim
    /// into the chunk stream as a terminal line. Returns None (no state
    /// change) for unknown or already-terminal jobs, so the ledger update
    /// driven by the returned snapshot happens exactly once.
    pub async fn complete(&self, job_id: &str, error: Option<String>) -> Option<CompletedJob> {
        let mut inner = self.inner.lock().await;
        let runtime = inner.jobs.get_mut(job_id)?;
        if runtime.terminal {
            return None;
        }
        if let Some(ref message) = error {
            let line = serde_json::json!({ "error": message, "done": true });
            runtime.chunks.push(Bytes::from(line.to_string()));
        }
        runtime.terminal = true;
        runtime.status = if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        runtime.error = error;
        Some(CompletedJob {
            status: runtime.status,
            error: runtime.error.clone(),
            chunks: runtime.chunks.clone(),
            assigned_node: runtime.assigned_node.clone(),
        })
    }

    /// Atomic snapshot of all chunks with index >= cursor.
    pub async fn drain_since(&self, job_id: &str, cursor: usize) -> Option<Drained> {
        let inner = self.inner.lock().await;
        let runtime = inner.jobs.get(job_id)?;
        let start = cursor.min(runtime.chunks.len());
        Some(Drained {
            chunks: runtime.chunks[start..].to_vec(),
            cursor: runtime.chunks.len(),
            terminal: runtime.terminal,
            error: runtime.error.clone(),
        })
    }

    pub async fn status(&self, job_id: &str) -> Option<JobStatus> {
        let inner = self.inner.lock().await;
        inner.jobs.get(job_id).map(|r| r.status)
    }

    pub async fn assigned_node(&self, job_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.jobs.get(job_id).and_then(|r| r.assigned_node.clone())
    }

    /// Drop the runtime entry once the relay has fully drained it. Ledger
    /// rows outlive runtime entries.
    pub async fn remove(&self, job_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.jobs.remove(job_id);
    }
}
