//! Opening handshake, both directions.
//!
//! # Responsibilities
//! - Validate an HTTP upgrade request and build the 101 response
//! - Build a client upgrade request and validate the server's answer

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::http::reader::{RawMessage, StartLine};
use crate::http::{ConnectionMode, Request, StatusCode, Verb};
use crate::http::request::Protocol;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const VERSION: &str = "13";

/// Header carrying the connecting peer's uuid on peer links.
pub const PEER_UUID_HEADER: &str = "X-Netplane-Uuid";
/// Header carrying the connecting peer's listening port.
pub const PEER_PORT_HEADER: &str = "X-Netplane-Port";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Upgrade must be an HTTP/1.1 GET")]
    NotGet,
    #[error("Missing or invalid header: {0}")]
    BadHeader(&'static str),
    #[error("Unsupported WebSocket version")]
    Version,
    #[error("Host port {0} does not match listener")]
    WrongPort(u16),
    #[error("Server refused upgrade with status {0}")]
    Refused(u16),
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Connection failed: {0}")]
    Io(String),
}

/// `Sec-WebSocket-Accept` for `key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A fresh random `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// The request asks for a WebSocket upgrade.
pub fn is_upgrade_request(request: &Request) -> bool {
    request.headers().has_token("Upgrade", "websocket")
}

pub fn validate_upgrade(request: &Request, local_port: u16) -> Result<(), HandshakeError> {
    if request.verb() != Verb::Get || request.protocol() != Protocol::Http11 {
        return Err(HandshakeError::NotGet);
    }
    let host = request
        .headers()
        .get("Host")
        .filter(|h| !h.trim().is_empty())
        .ok_or(HandshakeError::BadHeader("Host"))?;
    if let Some(port) = host_port(host) {
        if port != local_port {
            return Err(HandshakeError::WrongPort(port));
        }
    }
    if !request.headers().has_token("Connection", "upgrade") {
        return Err(HandshakeError::BadHeader("Connection"));
    }
    let key = request
        .headers()
        .get("Sec-WebSocket-Key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::BadHeader("Sec-WebSocket-Key"))?;
    if STANDARD.decode(key).map(|k| k.len()).unwrap_or(0) != 16 {
        return Err(HandshakeError::BadHeader("Sec-WebSocket-Key"));
    }
    if request.headers().get("Sec-WebSocket-Version").map(str::trim) != Some(VERSION) {
        return Err(HandshakeError::Version);
    }
    Ok(())
}

/// Turn a validated upgrade request into its 101 response.
pub fn accept_upgrade(request: &mut Request) {
    let key = request.headers().get("Sec-WebSocket-Key").unwrap_or_default().to_string();
    request.set_status(StatusCode::SwitchingProtocols);
    request.clear_response();
    request.set_connection(ConnectionMode::Upgrade);
    request.set_response_header("Upgrade", "websocket");
    request.set_response_header("Sec-WebSocket-Accept", accept_key(&key));
}

/// Turn a failed upgrade request into a 400.
pub fn reject_upgrade(request: &mut Request, error: &HandshakeError) {
    request.reject(StatusCode::BadRequest, &error.to_string());
    if *error == HandshakeError::Version {
        request.set_response_header("Sec-WebSocket-Version", VERSION);
    }
}

/// Client upgrade request text.
pub fn client_request(host: &str, port: u16, path: &str, key: &str, extra: &[(&str, String)]) -> String {
    let mut text = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         User-Agent: {agent}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: {VERSION}\r\n\
         Sec-WebSocket-Key: {key}\r\n",
        agent = crate::http::response::SERVER_NAME,
    );
    for (name, value) in extra {
        text.push_str(&format!("{name}: {value}\r\n"));
    }
    text.push_str("\r\n");
    text
}

/// Check the server's answer to our upgrade request.
pub fn validate_response(response: &RawMessage, key: &str) -> Result<(), HandshakeError> {
    let StartLine::Response { status, .. } = response.start else {
        return Err(HandshakeError::Malformed("expected a status line".into()));
    };
    if status != 101 {
        return Err(HandshakeError::Refused(status));
    }
    if !response.headers.has_token("Upgrade", "websocket") {
        return Err(HandshakeError::BadHeader("Upgrade"));
    }
    if !response.headers.has_token("Connection", "upgrade") {
        return Err(HandshakeError::BadHeader("Connection"));
    }
    if response.headers.get("Sec-WebSocket-Accept").map(str::trim) != Some(accept_key(key).as_str()) {
        return Err(HandshakeError::BadHeader("Sec-WebSocket-Accept"));
    }
    Ok(())
}

fn host_port(host: &str) -> Option<u16> {
    let host = host.trim();
    // Bracketed IPv6 literal: "[::1]:4840"
    let after = match host.strip_prefix('[') {
        Some(rest) => rest.split_once(']')?.1,
        None => host,
    };
    after.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::{test_request, Headers};

    fn upgrade_headers(key: &str) -> Vec<(&'static str, String)> {
        vec![
            ("Host", "127.0.0.1:4840".to_string()),
            ("Upgrade", "websocket".to_string()),
            ("Connection", "keep-alive, Upgrade".to_string()),
            ("Sec-WebSocket-Key", key.to_string()),
            ("Sec-WebSocket-Version", "13".to_string()),
        ]
    }

    fn request_with(headers: &[(&'static str, String)]) -> Request {
        let refs: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
        test_request("GET /echo HTTP/1.1", &refs)
    }

    #[test]
    fn rfc_accept_key() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn valid_upgrade_is_accepted() {
        let mut req = request_with(&upgrade_headers("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(is_upgrade_request(&req));
        assert_eq!(validate_upgrade(&req, 4840), Ok(()));

        accept_upgrade(&mut req);
        assert_eq!(req.status(), StatusCode::SwitchingProtocols);
        assert_eq!(
            req.response_headers().get("Sec-WebSocket-Accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[test]
    fn invalid_upgrades() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";

        let mut headers = upgrade_headers(key);
        headers[4].1 = "8".into();
        let mut req = request_with(&headers);
        let err = validate_upgrade(&req, 4840).unwrap_err();
        assert_eq!(err, HandshakeError::Version);
        reject_upgrade(&mut req, &err);
        assert_eq!(req.response_headers().get("Sec-WebSocket-Version"), Some("13"));

        let mut headers = upgrade_headers(key);
        headers[3].1 = "short".into();
        assert!(validate_upgrade(&request_with(&headers), 4840).is_err());

        assert_eq!(
            validate_upgrade(&request_with(&upgrade_headers(key)), 9999),
            Err(HandshakeError::WrongPort(4840))
        );

        let mut headers = upgrade_headers(key);
        headers.remove(0);
        assert_eq!(
            validate_upgrade(&request_with(&headers), 4840),
            Err(HandshakeError::BadHeader("Host"))
        );
    }

    #[test]
    fn client_response_validation() {
        let key = generate_key();
        let mut headers = Headers::new();
        headers.insert("Upgrade", "websocket");
        headers.insert("Connection", "Upgrade");
        headers.insert("Sec-WebSocket-Accept", accept_key(&key));
        let ok = RawMessage {
            start: StartLine::Response {
                status: 101,
                minor_version: 1,
            },
            headers: headers.clone(),
            body: Vec::new(),
        };
        assert_eq!(validate_response(&ok, &key), Ok(()));

        let refused = RawMessage {
            start: StartLine::Response {
                status: 401,
                minor_version: 1,
            },
            headers,
            body: Vec::new(),
        };
        assert_eq!(validate_response(&refused, &key), Err(HandshakeError::Refused(401)));
    }

    #[test]
    fn parses_host_ports() {
        assert_eq!(host_port("localhost:80"), Some(80));
        assert_eq!(host_port("[::1]:4840"), Some(4840));
        assert_eq!(host_port("[::1]"), None);
        assert_eq!(host_port("example.com"), None);
    }
}
