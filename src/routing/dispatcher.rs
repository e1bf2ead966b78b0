//! Request dispatch.
//!
//! # Responsibilities
//! - Authenticate, then either accept a WebSocket upgrade or find a handler
//! - Resolve JSON-RPC method paths to service methods
//!
//! # Design Decisions
//! - Authentication runs before anything else, including upgrades
//! - HTTP and RPC share the same registry and method tables

use std::net::SocketAddr;

use serde_json::Value;

use super::handler::CallContext;
use crate::context::ServerContext;
use crate::http::request::split_path;
use crate::http::auth::Principal;
use crate::http::{Request, StatusCode};
use crate::rpc::RpcError;
use crate::websocket::handshake;

/// What the connection should do after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Write the response and continue serving HTTP.
    Respond,
    /// Write the 101 and hand the socket to a WebSocket task.
    Upgrade,
}

pub fn dispatch(context: &ServerContext, request: &mut Request) -> Dispatch {
    if !context.auth().authenticate(request) {
        tracing::debug!(
            remote = ?request.remote(),
            path = %request.path(),
            "Unauthenticated request"
        );
        context.auth().challenge(request);
        return Dispatch::Respond;
    }

    if handshake::is_upgrade_request(request) {
        return match handshake::validate_upgrade(request, context.port()) {
            Ok(()) => {
                handshake::accept_upgrade(request);
                Dispatch::Upgrade
            }
            Err(e) => {
                tracing::warn!(remote = ?request.remote(), error = %e, "Rejected WebSocket upgrade");
                handshake::reject_upgrade(request, &e);
                Dispatch::Respond
            }
        };
    }

    match context.registry().lookup(request.path(), request.signature()) {
        Some(handler) => handler.process(context, request),
        None => request.reject(StatusCode::NotFound, "Not found"),
    }
    Dispatch::Respond
}

/// Invoke `method` (a full service path) with JSON-RPC params.
pub fn dispatch_rpc(
    context: &ServerContext,
    remote: Option<SocketAddr>,
    principal: Option<&Principal>,
    method: &str,
    params: &Value,
) -> Result<Value, RpcError> {
    let (signature, name) = split_path(method);
    let handler = context
        .registry()
        .get(&signature)
        .ok_or_else(|| RpcError::method_not_found(method))?;
    let service = handler.as_service().ok_or_else(|| RpcError::method_not_found(method))?;
    let ctx = CallContext {
        server: context,
        principal,
        remote,
    };
    service.call_rpc(&ctx, &name, params)
}
