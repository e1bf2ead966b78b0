//! Per-connection call correlation.
//!
//! # Responsibilities
//! - Allocate request ids and track outstanding calls
//! - Route replies to their calls
//! - Time out, cancel, and abort calls
//!
//! # Design Decisions
//! - Outstanding calls live in a concurrent map so the socket task and
//!   callers never contend on one lock
//! - Timers hold weak references; a finished call is simply not found
//! - `cancel` waits for in-flight reply handling to let go of the call before returning

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use super::envelope::{self, RpcError};
use super::request::{RpcCaller, RpcRequest};
use crate::net::ConnectionId;
use crate::observability::metrics;
use crate::websocket::Command;

/// Ids stay within the positive 31-bit range so every peer can represent them.
const MAX_ID: u64 = i32::MAX as u64;

/// Caller used for calls that are only awaited, never observed.
struct Detached;

impl RpcCaller for Detached {
    fn request_ready(&self, _: &Arc<RpcRequest>) {}
}

pub struct RpcCorrelator {
    connection: ConnectionId,
    outbound: mpsc::UnboundedSender<Command>,
    pending: DashMap<u64, Arc<RpcRequest>>,
    next_id: AtomicU64,
    timeout: Duration,
    closed: AtomicBool,
    detached: Arc<Detached>,
}

impl RpcCorrelator {
    pub fn new(connection: ConnectionId, outbound: mpsc::UnboundedSender<Command>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connection,
            outbound,
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            timeout,
            closed: AtomicBool::new(false),
            detached: Arc::new(Detached),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a call.
    ///
    /// With a parent the call is tracked and the parent told when it completes.
    /// Without one it goes out as a notification and `None` is returned.
    pub fn call(
        self: &Arc<Self>,
        method: &str,
        params: Vec<(String, Value)>,
        parent: Option<Weak<dyn RpcCaller>>,
    ) -> Option<Arc<RpcRequest>> {
        let Some(parent) = parent else {
            let envelope = envelope::request(method, &params, None);
            if !self.send(envelope) {
                tracing::debug!(connection_id = %self.connection, method = %method, "Notification dropped, connection closed");
            }
            metrics::record_rpc("notification");
            return None;
        };

        let id = self.allocate_id();
        let request = Arc::new(RpcRequest::new(id, method, params, parent));
        self.pending.insert(id, Arc::clone(&request));
        metrics::record_rpc_pending(1.0);

        let envelope = envelope::request(method, request.params(), Some(id));
        if self.closed.load(Ordering::SeqCst) || !self.send(envelope) {
            self.forget(id);
            request.abort("connection closed");
            metrics::record_rpc("aborted");
            return Some(request);
        }
        request.mark_sent();
        tracing::trace!(connection_id = %self.connection, id, method = %method, "RPC call sent");

        self.arm_timeout(&request);
        Some(request)
    }

    /// Send a call and wait for its outcome.
    pub async fn call_and_wait(self: &Arc<Self>, method: &str, params: Vec<(String, Value)>) -> Result<Value, RpcError> {
        let detached: Weak<dyn RpcCaller> = Arc::downgrade(&self.detached) as Weak<dyn RpcCaller>;
        let Some(request) = self.call(method, params, Some(detached)) else {
            return Err(RpcError::internal("call was not tracked"));
        };
        let state = request.wait().await;
        if let Some(error) = request.error() {
            return Err(error);
        }
        if state.contains(super::RequestState::TIMED_OUT) {
            return Err(RpcError::internal("timed out"));
        }
        Ok(request.reply().unwrap_or(Value::Null))
    }

    /// Deliver a reply. Returns false if no outstanding call has this id.
    pub fn handle_response(&self, id: Option<u64>, outcome: Result<Value, RpcError>) -> bool {
        let Some(id) = id else {
            tracing::warn!(connection_id = %self.connection, "Reply without a usable id");
            return false;
        };
        let Some(request) = self.forget(id) else {
            tracing::debug!(connection_id = %self.connection, id, "Reply for unknown or finished call");
            return false;
        };
        let ok = outcome.is_ok();
        if request.complete(outcome) {
            metrics::record_rpc(if ok { "ok" } else { "error" });
        }
        true
    }

    /// Cancel `request` and wait until nothing else holds it.
    ///
    /// A call that already finished is left as it is and this returns at once.
    pub async fn cancel(&self, request: &Arc<RpcRequest>, limit: Duration) {
        if request.state().is_terminal() {
            return;
        }
        self.forget(request.id());
        if !request.cancel() {
            return;
        }
        metrics::record_rpc("cancelled");

        let deadline = tokio::time::Instant::now() + limit;
        while Arc::strong_count(request) > 1 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    connection_id = %self.connection,
                    id = request.id(),
                    method = %request.method(),
                    "Cancelled call still referenced after timeout"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Abort every outstanding call; the connection is gone.
    pub fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some(request) = self.forget(id) {
                if request.abort(reason) {
                    metrics::record_rpc("aborted");
                }
            }
        }
    }

    fn allocate_id(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) % MAX_ID + 1;
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn forget(&self, id: u64) -> Option<Arc<RpcRequest>> {
        let removed = self.pending.remove(&id).map(|(_, r)| r);
        if removed.is_some() {
            metrics::record_rpc_pending(-1.0);
        }
        removed
    }

    fn send(&self, envelope: Value) -> bool {
        self.outbound.send(Command::Text(envelope.to_string())).is_ok()
    }

    fn arm_timeout(self: &Arc<Self>, request: &Arc<RpcRequest>) {
        let correlator = Arc::downgrade(self);
        let weak_request = Arc::downgrade(request);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let (Some(correlator), Some(request)) = (correlator.upgrade(), weak_request.upgrade()) else {
                return;
            };
            if correlator.forget(request.id()).is_some() && request.time_out() {
                tracing::warn!(
                    connection_id = %correlator.connection,
                    id = request.id(),
                    method = %request.method(),
                    "RPC call timed out"
                );
                metrics::record_rpc("timeout");
            }
        });
    }
}
