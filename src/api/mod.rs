// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod errors;
pub mod handlers;
pub mod http_server;
pub mod server;
pub mod worker_stream;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::{
    ChunkRequest, HealthResponse, InferenceRequest, ModelsResponse, NodesResponse,
    PaymentConfirmation, RegisterRequest, RegisterResponse, StatusResponse, WorkerQuery,
};
pub use http_server::OperatorState;
pub use server::{create_router, serve, JOB_ID_HEADER};
