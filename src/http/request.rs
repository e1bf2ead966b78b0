//! Parsed HTTP request and the response being built for it.
//!
//! # Responsibilities
//! - Interpret the start line (verb, target, protocol)
//! - Split the path into a handler signature and a method name
//! - Hold request headers, query and body
//! - Carry response status, headers, body and content type
//!
//! # Design Decisions
//! - One struct for both halves so handlers mutate the response in place
//! - Header lookups are case-insensitive, stored case-preserved, last value wins
//! - The response content type is negotiated from `Accept` once, up front
//! - Entity tags are a digest of the body, so any handler can offer revalidation

use std::fmt;
use std::net::SocketAddr;

use sha1::{Digest, Sha1};
use url::Url;

use super::auth::Principal;
use super::reader::{RawMessage, ReadError, StartLine};

/// HTTP request methods the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
}

impl Verb {
    pub const ALL: [Verb; 6] = [
        Verb::Get,
        Verb::Head,
        Verb::Post,
        Verb::Put,
        Verb::Delete,
        Verb::Options,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Verb::Get),
            "HEAD" => Some(Verb::Head),
            "POST" => Some(Verb::Post),
            "PUT" => Some(Verb::Put),
            "DELETE" => Some(Verb::Delete),
            "OPTIONS" => Some(Verb::Options),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
            Verb::Options => "OPTIONS",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Verb::Get => 1,
            Verb::Head => 1 << 1,
            Verb::Post => 1 << 2,
            Verb::Put => 1 << 3,
            Verb::Delete => 1 << 4,
            Verb::Options => 1 << 5,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of verbs, e.g. the verbs a service method accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verbs(u8);

impl Verbs {
    pub const NONE: Verbs = Verbs(0);
    pub const GET_HEAD: Verbs = Verbs(1 | 1 << 1);

    pub fn of(verbs: &[Verb]) -> Self {
        verbs.iter().fold(Verbs::NONE, |set, v| set.with(*v))
    }

    pub fn with(self, verb: Verb) -> Self {
        Verbs(self.0 | verb.bit())
    }

    pub fn contains(self, verb: Verb) -> bool {
        self.0 & verb.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Verb set implied by a method name: `Get*` is GET/HEAD, `Set*` is PUT,
    /// anything else POST.
    pub fn for_method_name(name: &str) -> Self {
        if name.starts_with("Get") {
            Verbs::GET_HEAD
        } else if name.starts_with("Set") {
            Verbs::of(&[Verb::Put])
        } else {
            Verbs::of(&[Verb::Post])
        }
    }

    pub fn iter(self) -> impl Iterator<Item = Verb> {
        Verb::ALL.into_iter().filter(move |v| self.contains(*v))
    }
}

impl fmt::Display for Verbs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Verb::as_str).collect();
        f.write_str(&names.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    Http11,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http10 => "HTTP/1.0",
            Protocol::Http11 => "HTTP/1.1",
        }
    }
}

/// Response status codes produced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    SwitchingProtocols,
    Ok,
    NotModified,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::SwitchingProtocols => 101,
            StatusCode::Ok => 200,
            StatusCode::NotModified => 304,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::SwitchingProtocols => "Switching Protocols",
            StatusCode::Ok => "OK",
            StatusCode::NotModified => "Not Modified",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

/// Serialisation formats for response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Xml,
    Html,
    /// XML property list.
    Plist,
    Plain,
}

impl ContentType {
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Xml => "application/xml",
            ContentType::Html => "text/html",
            ContentType::Plist => "application/plist",
            ContentType::Plain => "text/plain",
        }
    }

    /// Pick a serialiser from an `Accept` header. The first recognised media
    /// range wins; `*/*`, nothing, or nothing recognised means JSON.
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return ContentType::Json;
        };
        for range in accept.split(',') {
            let media = range.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            match media.as_str() {
                "application/json" | "text/json" | "text/javascript" => return ContentType::Json,
                "application/xml" | "text/xml" => return ContentType::Xml,
                "text/html" | "application/xhtml+xml" => return ContentType::Html,
                "application/plist" | "text/x-apple-plist+xml" => return ContentType::Plist,
                "*/*" => return ContentType::Json,
                _ => {}
            }
        }
        ContentType::Json
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any existing value for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(entry) => *entry = (name, value),
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True if the comma separated header `name` lists `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Decoded query parameters in request order. Repeats are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn parse(query: Option<&str>) -> Self {
        let pairs = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        Self(pairs)
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn count(&self, key: &str) -> usize {
        self.0.iter().filter(|(k, _)| k == key).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Whether the connection stays open after the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    KeepAlive,
    Close,
    Upgrade,
}

/// An HTTP request plus its in-progress response.
#[derive(Debug, Clone)]
pub struct Request {
    verb: Verb,
    protocol: Protocol,
    target: String,
    path: String,
    signature: String,
    method: String,
    headers: Headers,
    queries: QueryParams,
    body: Vec<u8>,
    remote: Option<SocketAddr>,
    principal: Option<Principal>,

    status: StatusCode,
    content_type: ContentType,
    response_type: Option<ContentType>,
    response_body: Vec<u8>,
    response_headers: Headers,
    connection: ConnectionMode,
}

impl Request {
    /// Interpret a raw message read from the wire.
    pub fn from_raw(raw: RawMessage, remote: Option<SocketAddr>) -> Result<Self, ReadError> {
        let StartLine::Request {
            verb,
            target,
            minor_version,
        } = &raw.start
        else {
            return Err(ReadError::Malformed("expected a request line".into()));
        };

        let verb = Verb::parse(verb).ok_or_else(|| ReadError::Malformed(format!("unknown verb '{verb}'")))?;
        let protocol = match minor_version {
            1 => Protocol::Http11,
            _ => Protocol::Http10,
        };
        let target = target.as_str();

        let base = Url::parse("http://localhost/").map_err(|e| ReadError::Malformed(e.to_string()))?;
        let url = base
            .join(target)
            .map_err(|e| ReadError::Malformed(format!("bad target '{target}': {e}")))?;

        let path = url.path().to_string();
        let (signature, method) = split_path(&path);

        let connection = if raw.headers.has_token("Connection", "close") {
            ConnectionMode::Close
        } else if protocol == Protocol::Http10 && !raw.headers.has_token("Connection", "keep-alive") {
            ConnectionMode::Close
        } else {
            ConnectionMode::KeepAlive
        };

        let content_type = ContentType::negotiate(raw.headers.get("Accept"));

        Ok(Self {
            verb,
            protocol,
            target: target.to_string(),
            signature,
            method,
            path,
            queries: QueryParams::parse(url.query()),
            headers: raw.headers,
            body: raw.body,
            remote,
            principal: None,
            status: StatusCode::NotFound,
            content_type,
            response_type: None,
            response_body: Vec::new(),
            response_headers: Headers::new(),
            connection,
        })
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The raw request target as sent.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path up to and including the final `/`.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Final path segment.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn queries(&self) -> &QueryParams {
        &self.queries
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Authenticated user, once authentication has run.
    pub fn user(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.user.as_str())
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn set_principal(&mut self, principal: Principal) {
        self.principal = Some(principal);
    }

    /// Negotiated serialisation for the response body.
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn response_type(&self) -> Option<ContentType> {
        self.response_type
    }

    pub fn response_body(&self) -> &[u8] {
        &self.response_body
    }

    pub fn set_response(&mut self, content_type: ContentType, body: Vec<u8>) {
        self.response_type = Some(content_type);
        self.response_body = body;
    }

    /// Set a 200 response the client may revalidate with `If-None-Match`.
    /// A matching tag turns it into a bodiless 304.
    pub fn set_tagged_response(&mut self, content_type: ContentType, body: Vec<u8>) {
        let tag = entity_tag(&body);
        let unmodified = self
            .headers
            .get("If-None-Match")
            .is_some_and(|v| v.split(',').map(str::trim).any(|t| t == "*" || t.trim_start_matches("W/") == tag));
        self.set_response_header("ETag", tag);
        if unmodified {
            self.status = StatusCode::NotModified;
            self.clear_response();
        } else {
            self.status = StatusCode::Ok;
            self.set_response(content_type, body);
        }
    }

    pub fn clear_response(&mut self) {
        self.response_type = None;
        self.response_body.clear();
    }

    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    pub fn set_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers.insert(name, value);
    }

    pub fn connection(&self) -> ConnectionMode {
        self.connection
    }

    pub fn set_connection(&mut self, mode: ConnectionMode) {
        self.connection = mode;
    }

    /// Set a plain text error response.
    pub fn reject(&mut self, status: StatusCode, message: &str) {
        self.status = status;
        self.set_response(ContentType::Plain, message.as_bytes().to_vec());
    }
}

/// Strong entity tag for `body`.
pub fn entity_tag(body: &[u8]) -> String {
    format!("\"{:x}\"", Sha1::digest(body))
}

/// Split a path into `(signature, method)` at the final `/`.
pub fn split_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(idx) => (path[..=idx].to_string(), path[idx + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

#[cfg(test)]
pub(crate) fn test_request(line: &str, headers: &[(&str, &str)]) -> Request {
    use super::reader::{HttpReader, ReaderLimits};

    let mut wire = format!("{line}\r\n");
    for (k, v) in headers {
        wire.push_str(&format!("{k}: {v}\r\n"));
    }
    wire.push_str("\r\n");
    let mut buffer = wire.into_bytes();
    let mut reader = HttpReader::new(ReaderLimits {
        max_header_lines: 200,
        max_body_bytes: 1024,
    });
    let raw = reader.read(&mut buffer).unwrap().unwrap();
    Request::from_raw(raw, None).unwrap()
}
