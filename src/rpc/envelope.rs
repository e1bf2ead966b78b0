//! JSON-RPC 2.0 envelopes.
//!
//! # Responsibilities
//! - Build request, notification, result and error envelopes
//! - Classify incoming objects as requests or responses
//!
//! # Design Decisions
//! - Envelopes are `serde_json::Value` so batches can be assembled piecemeal
//! - Outgoing ids are integers; incoming request ids are echoed verbatim

use serde_json::{json, Map, Value};

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Implementation-defined: the caller lacks the credentials the method needs.
    pub const UNAUTHORIZED: i64 = -32001;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error() -> Self {
        Self::new(Self::PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, detail)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, detail)
    }

    /// Read an error object received from the remote side.
    pub fn from_value(value: &Value) -> Self {
        let code = value.get("code").and_then(Value::as_i64).unwrap_or(Self::INTERNAL_ERROR);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();
        Self { code, message }
    }

    pub fn to_value(&self) -> Value {
        json!({ "code": self.code, "message": self.message })
    }
}

/// A request (with id) or notification (without).
pub fn request(method: &str, params: &[(String, Value)], id: Option<u64>) -> Value {
    let params: Map<String, Value> = params.iter().cloned().collect();
    let mut envelope = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    });
    if let (Some(id), Some(obj)) = (id, envelope.as_object_mut()) {
        obj.insert("id".into(), Value::from(id));
    }
    envelope
}

pub fn result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn error(id: Value, error: &RpcError) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error.to_value() })
}

/// What an incoming JSON object is.
#[derive(Debug, PartialEq)]
pub enum Incoming {
    /// A call to a local method. `id` is `None` for notifications.
    Request {
        method: String,
        params: Value,
        id: Option<Value>,
    },
    /// A reply to one of our calls.
    Response {
        id: Option<u64>,
        outcome: Result<Value, RpcError>,
    },
    Invalid {
        id: Option<Value>,
        reason: String,
    },
}

pub fn classify(object: &Map<String, Value>) -> Incoming {
    let id = object.get("id").filter(|v| !v.is_null()).cloned();
    let has_method = object.contains_key("method");
    let has_result = object.contains_key("result");
    let has_error = object.contains_key("error");

    match (has_method, has_result, has_error) {
        (true, false, false) => match object.get("method").and_then(Value::as_str) {
            Some(method) => Incoming::Request {
                method: method.to_string(),
                params: object.get("params").cloned().unwrap_or(Value::Null),
                id,
            },
            None => Incoming::Invalid {
                id,
                reason: "method must be a string".into(),
            },
        },
        (false, true, false) => Incoming::Response {
            id: id.as_ref().and_then(Value::as_u64),
            outcome: Ok(object.get("result").cloned().unwrap_or(Value::Null)),
        },
        (false, false, true) => Incoming::Response {
            id: id.as_ref().and_then(Value::as_u64),
            outcome: Err(RpcError::from_value(object.get("error").unwrap_or(&Value::Null))),
        },
        _ => Incoming::Invalid {
            id,
            reason: "expected exactly one of method, result or error".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn notification_has_no_id() {
        let env = request("/services/x/Ping", &[], None);
        assert!(env.get("id").is_none());
        let env = request("/services/x/Ping", &[("a".into(), json!(1))], Some(7));
        assert_eq!(env["id"], 7);
        assert_eq!(env["params"]["a"], 1);
    }

    #[test]
    fn classifies_messages() {
        assert!(matches!(
            classify(&object(json!({"jsonrpc": "2.0", "method": "m", "id": "abc"}))),
            Incoming::Request { id: Some(Value::String(_)), .. }
        ));
        assert_eq!(
            classify(&object(json!({"jsonrpc": "2.0", "result": 1, "id": 3}))),
            Incoming::Response { id: Some(3), outcome: Ok(json!(1)) }
        );
        let err = classify(&object(json!({"error": {"code": -32601, "message": "no"}, "id": 4})));
        assert_eq!(
            err,
            Incoming::Response {
                id: Some(4),
                outcome: Err(RpcError::new(-32601, "no"))
            }
        );
        assert!(matches!(
            classify(&object(json!({"method": "m", "result": 1}))),
            Incoming::Invalid { .. }
        ));
    }
}
