// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// OperatorState shared by API handlers and background tasks.
//
// Note: The HTTP router lives in server.rs; this module only provides
// the operator context that is passed to every handler.

use crate::channels::PushChannels;
use crate::config::OperatorConfig;
use crate::ledger::Ledger;
use crate::queue::JobQueue;
use crate::registry::Registry;

/// The singleton operator context. Initialized once at startup (open
/// ledger, create registry, start liveness loop) and handed to each
/// handler behind an Arc.
pub struct OperatorState {
    pub config: OperatorConfig,
    pub registry: Registry,
    pub channels: PushChannels,
    pub queue: JobQueue,
    pub ledger: Ledger,
}

impl OperatorState {
    pub fn new(config: OperatorConfig, ledger: Ledger) -> Self {
        OperatorState {
            config,
            registry: Registry::new(),
            channels: PushChannels::new(),
            queue: JobQueue::new(),
            ledger,
        }
    }
}
