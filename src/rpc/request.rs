//! An outstanding outbound call.
//!
//! # Responsibilities
//! - Track the lifecycle state of one call
//! - Hold the reply or error once it arrives
//! - Notify the owning caller, unless the call was cancelled
//!
//! # Design Decisions
//! - The parent is held weakly; a dropped caller just stops receiving updates
//! - A terminal state is never overwritten, so a late reply cannot resurrect
//!   a cancelled or timed out call

use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::Notify;

use super::envelope::RpcError;

/// Bit flags describing where a call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestState(u8);

impl RequestState {
    pub const NONE: RequestState = RequestState(0);
    pub const REQUEST_SENT: RequestState = RequestState(1);
    pub const REPLY_RECEIVED: RequestState = RequestState(1 << 1);
    pub const CANCELLED: RequestState = RequestState(1 << 2);
    pub const TIMED_OUT: RequestState = RequestState(1 << 3);
    pub const ERRORED: RequestState = RequestState(1 << 4);

    const TERMINAL: u8 = Self::REPLY_RECEIVED.0 | Self::CANCELLED.0 | Self::TIMED_OUT.0 | Self::ERRORED.0;

    pub fn contains(self, other: RequestState) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_terminal(self) -> bool {
        self.0 & Self::TERMINAL != 0
    }

    fn insert(&mut self, other: RequestState) {
        self.0 |= other.0;
    }
}

/// Receives completed calls.
pub trait RpcCaller: Send + Sync {
    /// Called once a call reaches a terminal state other than cancellation.
    fn request_ready(&self, request: &Arc<RpcRequest>);
}

#[derive(Debug, Default)]
struct Outcome {
    state: RequestState,
    reply: Option<Value>,
    error: Option<RpcError>,
}

pub struct RpcRequest {
    id: u64,
    method: String,
    params: Vec<(String, Value)>,
    parent: Weak<dyn RpcCaller>,
    outcome: Mutex<Outcome>,
    notify: Notify,
}

impl RpcRequest {
    pub(crate) fn new(id: u64, method: &str, params: Vec<(String, Value)>, parent: Weak<dyn RpcCaller>) -> Self {
        Self {
            id,
            method: method.to_string(),
            params,
            parent,
            outcome: Mutex::new(Outcome::default()),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[(String, Value)] {
        &self.params
    }

    pub fn state(&self) -> RequestState {
        self.lock().state
    }

    pub fn reply(&self) -> Option<Value> {
        self.lock().reply.clone()
    }

    pub fn error(&self) -> Option<RpcError> {
        self.lock().error.clone()
    }

    /// Wait until the call reaches a terminal state.
    pub async fn wait(&self) -> RequestState {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }

    pub(crate) fn mark_sent(&self) {
        self.lock().state.insert(RequestState::REQUEST_SENT);
    }

    /// Record a reply. Returns false if the call had already finished.
    pub(crate) fn complete(self: &Arc<Self>, outcome: Result<Value, RpcError>) -> bool {
        {
            let mut guard = self.lock();
            if guard.state.is_terminal() {
                return false;
            }
            guard.state.insert(RequestState::REPLY_RECEIVED);
            match outcome {
                Ok(value) => guard.reply = Some(value),
                Err(error) => {
                    guard.state.insert(RequestState::ERRORED);
                    guard.error = Some(error);
                }
            }
        }
        self.finish();
        true
    }

    pub(crate) fn time_out(self: &Arc<Self>) -> bool {
        self.terminate(RequestState::TIMED_OUT, None)
    }

    /// The connection went away before a reply.
    pub(crate) fn abort(self: &Arc<Self>, reason: &str) -> bool {
        self.terminate(RequestState::ERRORED, Some(RpcError::internal(reason)))
    }

    /// Mark cancelled. Returns false if the call had already finished.
    pub(crate) fn cancel(&self) -> bool {
        let mut guard = self.lock();
        if guard.state.is_terminal() {
            return false;
        }
        guard.state.insert(RequestState::CANCELLED);
        drop(guard);
        self.notify.notify_waiters();
        true
    }

    fn terminate(self: &Arc<Self>, state: RequestState, error: Option<RpcError>) -> bool {
        {
            let mut guard = self.lock();
            if guard.state.is_terminal() {
                return false;
            }
            guard.state.insert(state);
            guard.error = error;
        }
        self.finish();
        true
    }

    fn finish(self: &Arc<Self>) {
        self.notify.notify_waiters();
        if let Some(parent) = self.parent.upgrade() {
            parent.request_ready(self);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Outcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RpcRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("state", &self.state())
            .finish()
    }
}
