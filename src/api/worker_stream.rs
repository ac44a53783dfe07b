// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Worker-side streaming channel: one long-lived SSE response per
// connected worker, fed by its push channel. Idle seconds become
// heartbeat events, which double as registry liveness refreshes.

use crate::api::handlers::WorkerQuery;
use crate::api::http_server::OperatorState;
use crate::channels::{PushChannels, WorkerMessage};
use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Idle period after which a heartbeat event is emitted.
const WORKER_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Removes the worker's push channel when the SSE stream is dropped,
/// i.e. when the transport closes. Registry membership is left to the
/// liveness loop; tearing down a channel never unregisters the node.
struct ChannelGuard {
    node_id: String,
    generation: u64,
    channels: PushChannels,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.channels.detach(&self.node_id, self.generation);
    }
}

struct StreamCtx {
    state: Arc<OperatorState>,
    rx: mpsc::Receiver<WorkerMessage>,
    node_id: String,
    connected_sent: bool,
    _guard: ChannelGuard,
}

pub async fn stream_handler(
    State(state): State<Arc<OperatorState>>,
    Query(query): Query<WorkerQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    state.registry.heartbeat(&query.node_id).await;
    let (rx, generation) = state.channels.attach(&query.node_id);
    info!(
        "worker {} opened streaming channel (models: [{}])",
        query.node_id, query.models
    );

    let guard = ChannelGuard {
        node_id: query.node_id.clone(),
        generation,
        channels: state.channels.clone(),
    };
    let ctx = StreamCtx {
        state,
        rx,
        node_id: query.node_id,
        connected_sent: false,
        _guard: guard,
    };

    let events = futures::stream::unfold(ctx, |mut ctx| async move {
        if !ctx.connected_sent {
            ctx.connected_sent = true;
            return Some((Ok(Event::default().event("connected").data("{}")), ctx));
        }

        match tokio::time::timeout(WORKER_HEARTBEAT_PERIOD, ctx.rx.recv()).await {
            Ok(Some(WorkerMessage::JobPush(job))) => {
                let data = serde_json::to_string(&job).unwrap_or_default();
                Some((Ok(Event::default().event("job").data(data)), ctx))
            }
            Ok(Some(notice @ WorkerMessage::PaymentNotice { .. })) => {
                let data = serde_json::to_string(&notice).unwrap_or_default();
                Some((Ok(Event::default().event("payment_received").data(data)), ctx))
            }
            // Sender gone: this stream was superseded by a reconnect.
            Ok(None) => None,
            Err(_) => {
                ctx.state.registry.heartbeat(&ctx.node_id).await;
                Some((Ok(Event::default().event("heartbeat").data("{}")), ctx))
            }
        }
    });

    Sse::new(events)
}
