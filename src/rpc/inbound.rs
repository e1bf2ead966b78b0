//! Incoming JSON-RPC text.

use std::net::SocketAddr;

use serde_json::{Map, Value};

use super::correlator::RpcCorrelator;
use super::envelope::{self, classify, Incoming, RpcError};
use crate::context::ServerContext;
use crate::http::auth::Principal;
use crate::routing::dispatcher;

/// Handle one text message. Returns the reply to send, if any.
pub fn handle_text(
    context: &ServerContext,
    correlator: &RpcCorrelator,
    remote: Option<SocketAddr>,
    principal: Option<&Principal>,
    text: &str,
) -> Option<String> {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable JSON-RPC message");
            // Only something that was trying to be a request gets an answer.
            return text
                .contains("\"method\"")
                .then(|| envelope::error(Value::Null, &RpcError::parse_error()).to_string());
        }
    };

    let reply = match parsed {
        Value::Object(object) => handle_object(context, correlator, remote, principal, &object),
        Value::Array(items) if items.is_empty() => Some(invalid(None, "empty batch")),
        Value::Array(items) => {
            let replies: Vec<Value> = items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(object) => handle_object(context, correlator, remote, principal, object),
                    _ => Some(invalid(None, "batch entries must be objects")),
                })
                .collect();
            (!replies.is_empty()).then_some(Value::Array(replies))
        }
        _ => Some(invalid(None, "expected an object or array")),
    };
    reply.map(|r| r.to_string())
}

fn handle_object(
    context: &ServerContext,
    correlator: &RpcCorrelator,
    remote: Option<SocketAddr>,
    principal: Option<&Principal>,
    object: &Map<String, Value>,
) -> Option<Value> {
    match classify(object) {
        Incoming::Request { method, params, id } => {
            let outcome = dispatcher::dispatch_rpc(context, remote, principal, &method, &params);
            if let Err(e) = &outcome {
                tracing::debug!(method = %method, code = e.code, error = %e.message, "RPC request failed");
            }
            // Notifications get no reply, even on failure.
            let id = id?;
            Some(match outcome {
                Ok(result) => envelope::result(id, result),
                Err(error) => envelope::error(id, &error),
            })
        }
        Incoming::Response { id, outcome } => {
            correlator.handle_response(id, outcome);
            None
        }
        Incoming::Invalid { id, reason } => {
            tracing::debug!(reason = %reason, "Invalid JSON-RPC object");
            Some(invalid(id, &reason))
        }
    }
}

fn invalid(id: Option<Value>, reason: &str) -> Value {
    envelope::error(id.unwrap_or(Value::Null), &RpcError::invalid_request(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetplaneConfig;
    use crate::net::ConnectionId;
    use crate::services;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<ServerContext>, Arc<RpcCorrelator>) {
        let context = ServerContext::new(NetplaneConfig::default());
        services::register_builtin(&context);
        let (tx, _rx) = mpsc::unbounded_channel();
        let correlator = RpcCorrelator::new(ConnectionId::new(), tx, Duration::from_secs(5));
        (context, correlator)
    }

    fn reply(context: &ServerContext, correlator: &RpcCorrelator, text: &str) -> Option<Value> {
        handle_text(context, correlator, None, None, text).map(|r| serde_json::from_str(&r).unwrap())
    }

    #[test]
    fn request_reply_echoes_id() {
        let (context, correlator) = setup();
        let r = reply(
            &context,
            &correlator,
            r#"{"jsonrpc":"2.0","method":"/services/network/GetUuid","params":{},"id":7}"#,
        )
        .unwrap();
        assert_eq!(r["id"], json!(7));
        assert_eq!(r["result"], json!(context.identity().uuid));
    }

    #[test]
    fn notifications_get_no_reply() {
        let (context, correlator) = setup();
        assert!(reply(&context, &correlator, r#"{"jsonrpc":"2.0","method":"/services/network/GetUuid"}"#).is_none());
        assert!(reply(&context, &correlator, r#"{"jsonrpc":"2.0","method":"/nowhere/Nothing"}"#).is_none());
    }

    #[test]
    fn unknown_method_is_method_not_found() {
        let (context, correlator) = setup();
        let r = reply(&context, &correlator, r#"{"jsonrpc":"2.0","method":"/services/network/Nope","id":"x"}"#).unwrap();
        assert_eq!(r["id"], json!("x"));
        assert_eq!(r["error"]["code"], json!(RpcError::METHOD_NOT_FOUND));
    }

    #[test]
    fn parse_errors_only_for_request_like_text() {
        let (context, correlator) = setup();
        let r = reply(&context, &correlator, r#"{"method": "/services/network/GetUuid", "#).unwrap();
        assert_eq!(r["error"]["code"], json!(RpcError::PARSE_ERROR));
        assert!(reply(&context, &correlator, "hello there").is_none());
    }

    #[test]
    fn batches_are_handled_per_entry() {
        let (context, correlator) = setup();
        let r = reply(
            &context,
            &correlator,
            r#"[
                {"jsonrpc":"2.0","method":"/services/network/GetPriority","id":1},
                {"jsonrpc":"2.0","method":"/services/network/GetUuid"},
                {"jsonrpc":"2.0","method":"/services/network/Missing","id":2}
            ]"#,
        )
        .unwrap();
        let replies = r.as_array().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["result"], json!(0));
        assert_eq!(replies[1]["error"]["code"], json!(RpcError::METHOD_NOT_FOUND));

        let r = reply(&context, &correlator, "[]").unwrap();
        assert_eq!(r["error"]["code"], json!(RpcError::INVALID_REQUEST));
    }
}
