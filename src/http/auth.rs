//! Request authentication.
//!
//! # Responsibilities
//! - Check Basic credentials against the configured user
//! - Issue and redeem single-use WebSocket access tokens
//! - Build the 401 challenge
//!
//! # Design Decisions
//! - Tokens exist for browsers, which cannot set headers on a WebSocket upgrade
//! - A token is removed on first use, successful or not, and expires after a TTL
//! - Tokens are bound to the address that requested them

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::request::{Request, StatusCode};
use crate::config::AuthConfig;
use crate::observability::metrics;

/// Query parameter carrying an access token.
pub const TOKEN_PARAM: &str = "accesstoken";

/// How a request proved who it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    Token,
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
    pub method: AuthMethod,
}

impl Principal {
    pub fn new(user: impl Into<String>, method: AuthMethod) -> Self {
        Self {
            user: user.into(),
            method,
        }
    }

    /// Whether real credentials were presented, as opposed to a token.
    pub fn has_credentials(&self) -> bool {
        self.method == AuthMethod::Basic
    }
}

/// A single-use access token.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub user: String,
    pub host: Option<IpAddr>,
    issued: Instant,
}

/// Outstanding access tokens, keyed by token string.
#[derive(Debug)]
pub struct TokenStore {
    tokens: Mutex<HashMap<String, AuthToken>>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh token for `user`, usable only from `host`.
    pub fn issue(&self, user: &str, host: Option<IpAddr>) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let entry = AuthToken {
            user: user.to_string(),
            host,
            issued: Instant::now(),
        };
        self.lock().insert(token.clone(), entry);
        tracing::debug!(user = %user, "Issued access token");
        token
    }

    /// Consume `token`. Returns its owner if the token was live and the host matches.
    pub fn redeem(&self, token: &str, host: Option<IpAddr>) -> Option<String> {
        let entry = self.lock().remove(token)?;
        if entry.issued.elapsed() > self.ttl {
            tracing::debug!("Rejected expired access token");
            return None;
        }
        if let (Some(expected), Some(actual)) = (entry.host, host) {
            if expected != actual {
                tracing::warn!(expected = %expected, actual = %actual, "Access token used from another host");
                return None;
            }
        }
        Some(entry.user)
    }

    /// Drop expired tokens. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut tokens = self.lock();
        let before = tokens.len();
        tokens.retain(|_, t| t.issued.elapsed() <= ttl);
        before - tokens.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AuthToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decides whether a request may proceed.
#[derive(Debug)]
pub struct Authenticator {
    config: AuthConfig,
    tokens: TokenStore,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        let tokens = TokenStore::new(Duration::from_secs(config.token_ttl_secs));
        Self { config, tokens }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Authenticate `request`, recording the principal on success.
    ///
    /// With authentication disabled every request passes anonymously.
    pub fn authenticate(&self, request: &mut Request) -> bool {
        if !self.config.enabled {
            return true;
        }

        if let Some(user) = request.headers().get("Authorization").and_then(|h| self.check_basic(h)) {
            request.set_principal(Principal::new(user, AuthMethod::Basic));
            return true;
        }

        if let Some(token) = request.queries().get(TOKEN_PARAM) {
            let host = request.remote().map(|a| a.ip());
            if let Some(user) = self.tokens.redeem(token, host) {
                request.set_principal(Principal::new(user, AuthMethod::Token));
                return true;
            }
            metrics::record_auth_failure("token");
        } else {
            metrics::record_auth_failure("basic");
        }
        false
    }

    /// Turn `request` into a 401 challenge.
    pub fn challenge(&self, request: &mut Request) {
        request.reject(StatusCode::Unauthorized, "Authentication required");
        request.set_response_header(
            "WWW-Authenticate",
            format!("Basic realm=\"{}\"", self.config.realm),
        );
    }

    /// `Authorization` header value for outgoing requests to peers.
    pub fn basic_header(&self) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        Some(basic_header(&self.config.username, &self.config.password))
    }

    fn check_basic(&self, header: &str) -> Option<String> {
        let (user, password) = parse_basic(header)?;
        (user == self.config.username && password == self.config.password).then_some(user)
    }
}

pub fn basic_header(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}
