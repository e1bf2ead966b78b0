//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, pool capacity > 0)
//! - Check auth credentials are usable when auth is enabled
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: NetplaneConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::Ipv4Addr;

use crate::config::schema::NetplaneConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check a parsed configuration, collecting every error.
pub fn validate_config(config: &NetplaneConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.max_workers == 0 {
        errors.push(ValidationError::new("server.max_workers", "must be at least 1"));
    }
    if config.server.inactivity_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "server.inactivity_timeout_secs",
            "must be greater than 0",
        ));
    }
    if config.server.max_header_lines == 0 {
        errors.push(ValidationError::new("server.max_header_lines", "must be at least 1"));
    }
    if config.server.bind_host.trim().is_empty() {
        errors.push(ValidationError::new("server.bind_host", "must not be empty"));
    }

    if config.auth.enabled {
        if config.auth.username.is_empty() {
            errors.push(ValidationError::new("auth.username", "required when auth is enabled"));
        }
        if config.auth.username.contains(':') {
            errors.push(ValidationError::new("auth.username", "must not contain ':'"));
        }
        if config.auth.password.is_empty() {
            errors.push(ValidationError::new("auth.password", "required when auth is enabled"));
        }
    }
    if config.auth.token_ttl_secs == 0 {
        errors.push(ValidationError::new("auth.token_ttl_secs", "must be greater than 0"));
    }

    if config.websocket.max_payload_bytes < 125 {
        errors.push(ValidationError::new(
            "websocket.max_payload_bytes",
            "must allow at least a full control frame (125 bytes)",
        ));
    }

    if config.rpc.timeout_ms == 0 {
        errors.push(ValidationError::new("rpc.timeout_ms", "must be greater than 0"));
    }

    if config.peers.enabled {
        if config.peers.retry_interval_secs == 0 {
            errors.push(ValidationError::new("peers.retry_interval_secs", "must be greater than 0"));
        }
        if config.peers.beacon_interval_secs == 0 {
            errors.push(ValidationError::new("peers.beacon_interval_secs", "must be greater than 0"));
        }
        if config.peers.peer_timeout_secs <= config.peers.beacon_interval_secs {
            errors.push(ValidationError::new(
                "peers.peer_timeout_secs",
                "must be longer than the beacon interval",
            ));
        }
        match config.peers.multicast_group.parse::<Ipv4Addr>() {
            Ok(addr) if addr.is_multicast() => {}
            _ => errors.push(ValidationError::new(
                "peers.multicast_group",
                "must be an IPv4 multicast address",
            )),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
