// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use crate::registry::NodeInfo;
use serde::{Deserialize, Serialize};

/// Worker registration, `POST /register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub url: String,
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    pub node_id: String,
    pub models: Vec<String>,
    /// Advisory period for `/poll`-based workers, seconds.
    pub poll_interval: u64,
}

/// Client inference request, `POST /inference`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    pub prompt: String,
}

impl InferenceRequest {
    pub fn validate(&self) -> Result<(), crate::api::ApiError> {
        use crate::api::ApiError;

        if self.model.trim().is_empty() {
            return Err(ApiError::BadRequest("model cannot be empty".to_string()));
        }
        if self.prompt.is_empty() {
            return Err(ApiError::BadRequest("prompt cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// One streamed output line posted back by a worker,
/// `POST /jobs/{id}/chunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub chunk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn new(status: &str) -> Self {
        StatusResponse {
            status: status.to_string(),
        }
    }
}

/// Settlement confirmation, `POST /payment-confirmed`. Unknown fields
/// in the body are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Query half of `GET /stream` and `GET /poll`: the worker identifies
/// itself and the models it can serve (comma-separated).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerQuery {
    pub node_id: String,
    #[serde(default)]
    pub models: String,
}

impl WorkerQuery {
    pub fn model_list(&self) -> Vec<String> {
        self.models
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(String::from)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DoneQuery {
    #[serde(default)]
    pub error: Option<String>,
}
