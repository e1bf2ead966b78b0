//! The handler trait and its identity.

use std::net::SocketAddr;

use crate::context::ServerContext;
use crate::http::auth::Principal;
use crate::http::Request;

use super::service::Service;

/// Where a handler is mounted and how it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerMeta {
    signature: String,
    name: String,
    recursive: bool,
}

impl HandlerMeta {
    pub fn new(signature: &str, name: &str) -> Self {
        Self {
            signature: normalize_signature(signature),
            name: name.to_string(),
            recursive: false,
        }
    }

    /// Also match every path below the signature.
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }
}

/// A request handler mounted at a signature.
pub trait Handler: Send + Sync {
    fn meta(&self) -> &HandlerMeta;

    /// Fill in the response on `request`.
    fn process(&self, context: &ServerContext, request: &mut Request);

    /// The method table, for handlers that expose one.
    fn as_service(&self) -> Option<&Service> {
        None
    }
}

/// Caller information passed to service methods.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub server: &'a ServerContext,
    pub principal: Option<&'a Principal>,
    pub remote: Option<SocketAddr>,
}

impl CallContext<'_> {
    pub fn user(&self) -> Option<&str> {
        self.principal.map(|p| p.user.as_str())
    }
}

/// Leading and trailing slash, no empty segments.
pub fn normalize_signature(signature: &str) -> String {
    let segments: Vec<&str> = signature.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", segments.join("/"))
    }
}
