//! Services: handlers that expose a table of typed methods.
//!
//! # Responsibilities
//! - Validate method declarations once, at construction
//! - Bind query strings (HTTP) or JSON params (RPC) to declared parameters
//! - Enforce verbs, answer OPTIONS and `help`
//! - Wrap and serialise return values
//!
//! # Design Decisions
//! - Method tables are explicit declarations, not discovered at runtime
//! - Invalid declarations are logged and dropped; the rest of the service still loads
//! - Every declared parameter must appear exactly once; extras are an error

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Number, Value};

use super::handler::{CallContext, Handler, HandlerMeta};
use crate::context::ServerContext;
use crate::http::auth::TOKEN_PARAM;
use crate::http::response::{escape, serialise};
use crate::http::{QueryParams, Request, StatusCode, Verb, Verbs};
use crate::rpc::RpcError;

/// Failure reported by a service method.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Failed(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            ServiceError::InvalidArgument(_) | ServiceError::Failed(_) => StatusCode::BadRequest,
            ServiceError::Unauthorized(_) => StatusCode::Unauthorized,
        }
    }
}

impl From<ServiceError> for RpcError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::InvalidArgument(msg) => RpcError::invalid_params(msg),
            ServiceError::Unauthorized(msg) => RpcError::new(RpcError::UNAUTHORIZED, msg),
            other => RpcError::internal(other.to_string()),
        }
    }
}

/// Declared type of a method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    Int,
    UInt,
    Float,
    String,
}

impl ParamType {
    pub fn name(self) -> &'static str {
        match self {
            ParamType::Bool => "bool",
            ParamType::Int => "int",
            ParamType::UInt => "uint",
            ParamType::Float => "float",
            ParamType::String => "string",
        }
    }

    /// Parse a query string value.
    pub fn parse(self, raw: &str) -> Result<Value, String> {
        let bad = || format!("'{raw}' is not a valid {}", self.name());
        match self {
            ParamType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(bad()),
            },
            ParamType::Int => raw.parse::<i64>().map(Value::from).map_err(|_| bad()),
            ParamType::UInt => raw.parse::<u64>().map(Value::from).map_err(|_| bad()),
            ParamType::Float => raw
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(bad),
            ParamType::String => Ok(Value::String(raw.to_string())),
        }
    }

    /// Check (and where needed convert) a JSON value.
    pub fn coerce(self, value: &Value) -> Result<Value, String> {
        match (self, value) {
            (_, Value::String(s)) => self.parse(s),
            (ParamType::Bool, Value::Bool(_)) => Ok(value.clone()),
            (ParamType::Int, Value::Number(n)) if n.as_i64().is_some() => Ok(value.clone()),
            (ParamType::UInt, Value::Number(n)) if n.is_u64() => Ok(value.clone()),
            (ParamType::Float, Value::Number(_)) => Ok(value.clone()),
            _ => Err(format!("expected {}, got {value}", self.name())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamType,
}

/// Bound, typed arguments for one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments(Map<String, Value>);

impl Arguments {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Result<&str, ServiceError> {
        self.0
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::InvalidArgument(format!("missing string '{name}'")))
    }

    pub fn i64(&self, name: &str) -> Result<i64, ServiceError> {
        self.0
            .get(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| ServiceError::InvalidArgument(format!("missing integer '{name}'")))
    }

    pub fn u64(&self, name: &str) -> Result<u64, ServiceError> {
        self.0
            .get(name)
            .and_then(Value::as_u64)
            .ok_or_else(|| ServiceError::InvalidArgument(format!("missing unsigned integer '{name}'")))
    }

    pub fn f64(&self, name: &str) -> Result<f64, ServiceError> {
        self.0
            .get(name)
            .and_then(Value::as_f64)
            .ok_or_else(|| ServiceError::InvalidArgument(format!("missing number '{name}'")))
    }

    pub fn bool(&self, name: &str) -> Result<bool, ServiceError> {
        self.0
            .get(name)
            .and_then(Value::as_bool)
            .ok_or_else(|| ServiceError::InvalidArgument(format!("missing bool '{name}'")))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub type MethodFn =
    Arc<dyn Fn(&CallContext<'_>, &Arguments) -> Result<Option<Value>, ServiceError> + Send + Sync>;

/// Declaration of one service method, validated when the service is built.
pub struct MethodSpec {
    name: String,
    params: Vec<ParamSpec>,
    verbs: Option<Verbs>,
    return_tag: Option<String>,
    void: bool,
    call: MethodFn,
}

impl MethodSpec {
    pub fn new<F>(name: &str, call: F) -> Self
    where
        F: Fn(&CallContext<'_>, &Arguments) -> Result<Option<Value>, ServiceError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            verbs: None,
            return_tag: None,
            void: false,
            call: Arc::new(call),
        }
    }

    pub fn param(mut self, name: &str, kind: ParamType) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            kind,
        });
        self
    }

    /// Override the verbs implied by the method name.
    pub fn verbs(mut self, verbs: Verbs) -> Self {
        self.verbs = Some(verbs);
        self
    }

    /// Name the return value is wrapped under.
    pub fn returns(mut self, tag: &str) -> Self {
        self.return_tag = Some(tag.to_string());
        self
    }

    /// The method returns nothing; responses have an empty body.
    pub fn void(mut self) -> Self {
        self.void = true;
        self
    }
}

/// Why a method declaration was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MethodRejected {
    #[error("invalid method name")]
    InvalidName,
    #[error("'help' is reserved")]
    ReservedName,
    #[error("duplicate method")]
    Duplicate,
    #[error("invalid or duplicate parameter '{0}'")]
    BadParam(String),
    #[error("no verbs allowed")]
    NoVerbs,
    #[error("void methods cannot declare a return tag")]
    VoidWithTag,
}

/// A validated method.
pub struct ServiceMethod {
    name: String,
    params: Vec<ParamSpec>,
    verbs: Verbs,
    return_tag: String,
    void: bool,
    call: MethodFn,
}

impl ServiceMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn verbs(&self) -> Verbs {
        self.verbs
    }

    pub fn return_tag(&self) -> &str {
        &self.return_tag
    }

    pub fn is_void(&self) -> bool {
        self.void
    }

    fn bind_query(&self, query: &QueryParams) -> Result<Arguments, String> {
        for (key, _) in query.iter() {
            if key != TOKEN_PARAM && !self.params.iter().any(|p| p.name == key) {
                return Err(format!("Unexpected parameter '{key}'"));
            }
        }
        let mut args = Map::new();
        for param in &self.params {
            match query.count(&param.name) {
                0 => return Err(format!("Missing parameter '{}'", param.name)),
                1 => {}
                _ => return Err(format!("Parameter '{}' given more than once", param.name)),
            }
            let raw = query.get(&param.name).unwrap_or_default();
            let value = param.kind.parse(raw).map_err(|e| format!("Parameter '{}': {e}", param.name))?;
            args.insert(param.name.clone(), value);
        }
        Ok(Arguments(args))
    }

    fn bind_json(&self, params: &Value) -> Result<Arguments, String> {
        let mut args = Map::new();
        match params {
            Value::Null => {
                if let Some(first) = self.params.first() {
                    return Err(format!("Missing parameter '{}'", first.name));
                }
            }
            Value::Object(map) => {
                if let Some(extra) = map.keys().find(|k| !self.params.iter().any(|p| &p.name == *k)) {
                    return Err(format!("Unexpected parameter '{extra}'"));
                }
                for param in &self.params {
                    let value = map
                        .get(&param.name)
                        .ok_or_else(|| format!("Missing parameter '{}'", param.name))?;
                    let value = param.kind.coerce(value).map_err(|e| format!("Parameter '{}': {e}", param.name))?;
                    args.insert(param.name.clone(), value);
                }
            }
            Value::Array(items) => {
                if items.len() != self.params.len() {
                    return Err(format!("Expected {} parameters, got {}", self.params.len(), items.len()));
                }
                for (param, value) in self.params.iter().zip(items) {
                    let value = param.kind.coerce(value).map_err(|e| format!("Parameter '{}': {e}", param.name))?;
                    args.insert(param.name.clone(), value);
                }
            }
            _ => return Err("params must be an object or array".to_string()),
        }
        Ok(Arguments(args))
    }
}

impl fmt::Debug for ServiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceMethod")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("verbs", &self.verbs)
            .field("return_tag", &self.return_tag)
            .field("void", &self.void)
            .finish()
    }
}

fn validate(spec: MethodSpec, existing: &BTreeMap<String, ServiceMethod>) -> Result<ServiceMethod, MethodRejected> {
    let valid_ident = |s: &str| {
        !s.is_empty()
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !s.starts_with(|c: char| c.is_ascii_digit())
    };

    if !valid_ident(&spec.name) {
        return Err(MethodRejected::InvalidName);
    }
    if spec.name.eq_ignore_ascii_case("help") {
        return Err(MethodRejected::ReservedName);
    }
    if existing.contains_key(&spec.name) {
        return Err(MethodRejected::Duplicate);
    }
    for (i, param) in spec.params.iter().enumerate() {
        let repeated = spec.params[..i].iter().any(|p| p.name == param.name);
        if !valid_ident(&param.name) || param.name == TOKEN_PARAM || repeated {
            return Err(MethodRejected::BadParam(param.name.clone()));
        }
    }
    let verbs = spec.verbs.unwrap_or_else(|| Verbs::for_method_name(&spec.name));
    if verbs.is_empty() {
        return Err(MethodRejected::NoVerbs);
    }
    if spec.void && spec.return_tag.is_some() {
        return Err(MethodRejected::VoidWithTag);
    }

    let return_tag = spec.return_tag.clone().unwrap_or_else(|| {
        match spec.name.strip_prefix("Get") {
            Some(rest) if !rest.is_empty() => rest.to_string(),
            _ => spec.name.clone(),
        }
    });

    Ok(ServiceMethod {
        name: spec.name,
        params: spec.params,
        verbs,
        return_tag,
        void: spec.void,
        call: spec.call,
    })
}

/// A handler exposing typed methods under one signature.
pub struct Service {
    meta: HandlerMeta,
    methods: BTreeMap<String, ServiceMethod>,
}

impl Service {
    pub fn new(signature: &str, name: &str, specs: Vec<MethodSpec>) -> Self {
        let meta = HandlerMeta::new(signature, name);
        let mut methods = BTreeMap::new();
        for spec in specs {
            let method_name = spec.name.clone();
            match validate(spec, &methods) {
                Ok(method) => {
                    methods.insert(method_name, method);
                }
                Err(reason) => tracing::error!(
                    service = %meta.name(),
                    method = %method_name,
                    reason = %reason,
                    "Rejected service method"
                ),
            }
        }
        tracing::debug!(service = %meta.name(), methods = methods.len(), "Service built");
        Self { meta, methods }
    }

    pub fn method(&self, name: &str) -> Option<&ServiceMethod> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &ServiceMethod> {
        self.methods.values()
    }

    /// Invoke `method` with JSON-RPC params.
    ///
    /// Returns the bare result value; `null` for void methods.
    pub fn call_rpc(&self, ctx: &CallContext<'_>, method: &str, params: &Value) -> Result<Value, RpcError> {
        let method = self
            .methods
            .get(method)
            .ok_or_else(|| RpcError::method_not_found(method))?;
        let args = method.bind_json(params).map_err(RpcError::invalid_params)?;
        let value = (method.call)(ctx, &args)?;
        Ok(if method.void { Value::Null } else { value.unwrap_or(Value::Null) })
    }

    fn help(&self, request: &mut Request) {
        let mut rows = String::new();
        for method in self.methods.values() {
            let params: Vec<String> = method
                .params
                .iter()
                .map(|p| format!("{} {}", p.kind.name(), escape(&p.name)))
                .collect();
            let returns = if method.void { "void".to_string() } else { escape(&method.return_tag) };
            rows.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape(&method.name),
                params.join(", "),
                returns,
                method.verbs.with(Verb::Options),
            ));
        }

        let body = format!(
            "<!DOCTYPE html><html><head><title>{name}</title></head><body>\
             <h1><a href=\"/services/\">Services</a> &gt; {name}</h1>\
             <h3>Method list for {signature}</h3>\
             <table><tr><th>Method</th><th>Parameters</th><th>Returns</th><th>Verbs</th></tr>{rows}</table>\
             </body></html>",
            name = escape(self.meta.name()),
            signature = escape(self.meta.signature()),
        );
        request.set_tagged_response(crate::http::ContentType::Html, body.into_bytes());
    }
}

impl Handler for Service {
    fn meta(&self) -> &HandlerMeta {
        &self.meta
    }

    fn process(&self, context: &ServerContext, request: &mut Request) {
        if request.method().eq_ignore_ascii_case("help") {
            self.help(request);
            return;
        }

        let Some(method) = self.methods.get(request.method()) else {
            request.reject(StatusCode::NotFound, "Method not found");
            return;
        };

        let allowed = method.verbs.with(Verb::Options);
        if request.verb() == Verb::Options {
            request.set_status(StatusCode::Ok);
            request.clear_response();
            request.set_response_header("Allow", allowed.to_string());
            return;
        }

        if !method.verbs.contains(request.verb()) {
            tracing::debug!(
                method = %method.name,
                verb = %request.verb(),
                "Verb not allowed for method"
            );
            request.reject(
                StatusCode::BadRequest,
                &format!("{} does not accept {}", method.name, request.verb()),
            );
            request.set_response_header("Allow", allowed.to_string());
            return;
        }

        let args = match method.bind_query(request.queries()) {
            Ok(args) => args,
            Err(message) => {
                request.reject(StatusCode::BadRequest, &message);
                return;
            }
        };

        let result = {
            let ctx = CallContext {
                server: context,
                principal: request.principal(),
                remote: request.remote(),
            };
            (method.call)(&ctx, &args)
        };

        match result {
            Ok(_) if method.void => {
                request.set_status(StatusCode::Ok);
                request.clear_response();
            }
            Ok(value) => {
                let content_type = request.content_type();
                let body = serialise(content_type, &method.return_tag, &value.unwrap_or(Value::Null));
                request.set_status(StatusCode::Ok);
                request.set_response(content_type, body);
            }
            Err(e) => {
                tracing::debug!(method = %method.name, error = %e, "Service method failed");
                match e {
                    ServiceError::Unauthorized(_) => context.auth().challenge(request),
                    other => request.reject(other.status(), &other.to_string()),
                }
            }
        }
    }

    fn as_service(&self) -> Option<&Service> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetplaneConfig;
    use crate::http::request::test_request;
    use serde_json::json;

    fn sample() -> Service {
        Service::new(
            "/services/sample",
            "sample",
            vec![
                MethodSpec::new("GetValue", |_, _| Ok(Some(json!(42)))),
                MethodSpec::new("SetValue", |_, args| {
                    args.i64("value")?;
                    Ok(None)
                })
                .param("value", ParamType::Int)
                .void(),
                MethodSpec::new("Add", |_, args| Ok(Some(json!(args.i64("a")? + args.i64("b")?))))
                    .param("a", ParamType::Int)
                    .param("b", ParamType::Int)
                    .returns("sum"),
                MethodSpec::new("help", |_, _| Ok(None)),
                MethodSpec::new("GetValue", |_, _| Ok(None)),
                MethodSpec::new("Bad", |_, _| Ok(None)).param("accesstoken", ParamType::String),
            ],
        )
    }

    fn run(service: &Service, line: &str) -> Request {
        let context = ServerContext::new(NetplaneConfig::default());
        let mut request = test_request(line, &[]);
        service.process(&context, &mut request);
        request
    }

    fn body(request: &Request) -> Value {
        serde_json::from_slice(request.response_body()).unwrap()
    }

    #[test]
    fn invalid_declarations_are_dropped() {
        let service = sample();
        let names: Vec<&str> = service.methods().map(|m| m.name()).collect();
        assert_eq!(names, vec!["Add", "GetValue", "SetValue"]);
        assert_eq!(service.meta().signature(), "/services/sample/");
    }

    #[test]
    fn get_wraps_under_stripped_name() {
        let req = run(&sample(), "GET /services/sample/GetValue HTTP/1.1");
        assert_eq!(req.status(), StatusCode::Ok);
        assert_eq!(body(&req), json!({"Value": 42}));
    }

    #[test]
    fn binds_typed_parameters() {
        let req = run(&sample(), "POST /services/sample/Add?a=2&b=3 HTTP/1.1");
        assert_eq!(req.status(), StatusCode::Ok);
        assert_eq!(body(&req), json!({"sum": 5}));
    }

    #[test]
    fn parameter_errors_are_bad_requests() {
        let service = sample();
        for line in [
            "POST /services/sample/Add?a=2 HTTP/1.1",
            "POST /services/sample/Add?a=2&b=3&c=4 HTTP/1.1",
            "POST /services/sample/Add?a=2&a=5&b=3 HTTP/1.1",
            "POST /services/sample/Add?a=x&b=3 HTTP/1.1",
        ] {
            assert_eq!(run(&service, line).status(), StatusCode::BadRequest, "{line}");
        }
        // Access tokens never count as parameters.
        let req = run(&service, "POST /services/sample/Add?a=1&b=1&accesstoken=abc HTTP/1.1");
        assert_eq!(req.status(), StatusCode::Ok);
    }

    #[test]
    fn wrong_verb_lists_allowed() {
        let req = run(&sample(), "POST /services/sample/GetValue HTTP/1.1");
        assert_eq!(req.status(), StatusCode::BadRequest);
        assert_eq!(req.response_headers().get("Allow"), Some("GET, HEAD, OPTIONS"));
    }

    #[test]
    fn options_does_not_invoke() {
        let req = run(&sample(), "OPTIONS /services/sample/SetValue HTTP/1.1");
        assert_eq!(req.status(), StatusCode::Ok);
        assert!(req.response_body().is_empty());
        assert_eq!(req.response_headers().get("Allow"), Some("PUT, OPTIONS"));
    }

    #[test]
    fn void_method_has_empty_body() {
        let req = run(&sample(), "PUT /services/sample/SetValue?value=7 HTTP/1.1");
        assert_eq!(req.status(), StatusCode::Ok);
        assert!(req.response_body().is_empty());
        assert!(req.response_type().is_none());
    }

    #[test]
    fn help_lists_methods() {
        let req = run(&sample(), "GET /services/sample/HELP HTTP/1.1");
        assert_eq!(req.status(), StatusCode::Ok);
        let html = String::from_utf8(req.response_body().to_vec()).unwrap();
        assert!(html.contains("Method list for /services/sample/"));
        assert!(html.contains("<td>Add</td><td>int a, int b</td><td>sum</td>"));
    }

    #[test]
    fn unknown_method_is_not_found() {
        let req = run(&sample(), "GET /services/sample/Nope HTTP/1.1");
        assert_eq!(req.status(), StatusCode::NotFound);
    }

    #[test]
    fn rpc_binding() {
        let context = ServerContext::new(NetplaneConfig::default());
        let ctx = CallContext {
            server: &context,
            principal: None,
            remote: None,
        };
        let service = sample();
        assert_eq!(service.call_rpc(&ctx, "Add", &json!({"a": 1, "b": "2"})).unwrap(), json!(3));
        assert_eq!(service.call_rpc(&ctx, "Add", &json!([4, 5])).unwrap(), json!(9));
        assert_eq!(service.call_rpc(&ctx, "GetValue", &Value::Null).unwrap(), json!(42));
        assert_eq!(
            service.call_rpc(&ctx, "Add", &json!({"a": 1})).unwrap_err().code,
            RpcError::INVALID_PARAMS
        );
        assert_eq!(
            service.call_rpc(&ctx, "Nope", &Value::Null).unwrap_err().code,
            RpcError::METHOD_NOT_FOUND
        );
    }
}
