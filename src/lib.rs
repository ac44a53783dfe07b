// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod api;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod ledger;
pub mod liveness;
pub mod queue;
pub mod registry;
pub mod relay;

// Re-export main types
pub use api::{create_router, ApiError, OperatorState, JOB_ID_HEADER};
pub use channels::{PushChannels, WorkerMessage};
pub use config::OperatorConfig;
pub use ledger::{JobAccounting, JobRecord, Ledger, PaymentRecord};
pub use queue::{Job, JobQueue, JobStatus};
pub use registry::{Node, NodeInfo, Registry};
