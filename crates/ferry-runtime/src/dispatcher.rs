//! Throttled delivery of "post" host operations.
//!
//! Results never go back to the caller. Each operation ends in exactly one
//! broadcast: `data` on success, `error` on failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ferry_core::ids::CallId;
use ferry_core::{BroadcastEvent, DispatchOptions, HostDispatch, Params};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn, Instrument};

use crate::bus::BroadcastBus;
use crate::gate::{AdmissionGate, GateStats};

/// Eviction timer for post operations.
pub const POST_TIMER: Duration = Duration::from_millis(64);

const POST_OPERATION: &str = "post";

/// One post operation as handed to [`PostQueue::dispatch`].
#[derive(Clone, Debug)]
pub struct PostRequest {
    pub id: CallId,
    pub seq: u64,
    pub params: Value,
    pub headers: BTreeMap<String, String>,
}

impl PostRequest {
    pub fn new(id: CallId, seq: u64) -> Self {
        Self {
            id,
            seq,
            params: Value::Null,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Dispatches post operations through a bounded gate.
#[derive(Clone)]
pub struct PostQueue {
    gate: AdmissionGate,
    host: Arc<dyn HostDispatch>,
    bus: BroadcastBus,
}

impl PostQueue {
    pub fn new(
        concurrency: Option<usize>,
        timer: Duration,
        host: Arc<dyn HostDispatch>,
        bus: BroadcastBus,
    ) -> Self {
        Self {
            gate: AdmissionGate::new(concurrency).with_timer(timer),
            host,
            bus,
        }
    }

    /// A queue with the default limit and the 64 ms eviction timer.
    pub fn with_defaults(host: Arc<dyn HostDispatch>, bus: BroadcastBus) -> Self {
        Self::new(None, POST_TIMER, host, bus)
    }

    pub fn limit(&self) -> usize {
        self.gate.limit()
    }

    pub fn stats(&self) -> GateStats {
        self.gate.stats()
    }

    /// Run one post operation and broadcast its outcome.
    ///
    /// Waits for admission, then for the host. Never fails.
    pub async fn dispatch(&self, request: PostRequest) {
        let span = tracing::debug_span!("post", call_id = %request.id, seq = request.seq);
        self.dispatch_inner(request).instrument(span).await;
    }

    async fn dispatch_inner(&self, request: PostRequest) {
        let PostRequest {
            id,
            params,
            headers,
            ..
        } = request;

        let (settle, placeholder) = oneshot::channel::<()>();
        self.gate
            .push(async move {
                let _ = placeholder.await;
            })
            .await;

        let mut params = match params {
            Value::Object(map) => map,
            _ => Params::new(),
        };
        params.insert("id".into(), Value::String(id.to_string()));

        let mut call = Params::new();
        call.insert("id".into(), Value::String(id.to_string()));

        match self
            .host
            .dispatch(POST_OPERATION, call, DispatchOptions::binary())
            .await
        {
            Err(err) => {
                let _ = settle.send(());
                warn!(error = %err, kind = err.error_kind(), "post failed");
                self.bus.publish(BroadcastEvent::error(&id, &err));
            }
            Ok(payload) => {
                tokio::task::yield_now().await;
                let _ = settle.send(());
                let data = payload.into_bytes();
                debug!(bytes = data.len(), "post completed");
                self.bus
                    .publish(BroadcastEvent::data(&id, &headers, params, data));
            }
        }
    }
}
