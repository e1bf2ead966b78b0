//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a netplane
//! instance. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for a netplane instance.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NetplaneConfig {
    /// HTTP listener settings.
    pub server: ServerConfig,

    /// Credential and access-token settings.
    pub auth: AuthConfig,

    /// WebSocket framing limits and timeouts.
    pub websocket: WebSocketConfig,

    /// Outbound JSON-RPC call settings.
    pub rpc: RpcConfig,

    /// Peer discovery and connection negotiation.
    pub peers: PeerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host/interface to bind (e.g., "0.0.0.0").
    pub bind_host: String,

    /// Preferred port. An ephemeral port is used if it is taken.
    pub port: u16,

    /// Maximum concurrently served connections (worker pool capacity).
    pub max_workers: usize,

    /// Close a connection after this many seconds without inbound bytes.
    pub inactivity_timeout_secs: u64,

    /// Maximum header lines per request before the request is aborted.
    pub max_header_lines: usize,

    /// Maximum accepted `Content-Length`.
    pub max_body_bytes: usize,

    /// File recording the last bound port. `None` disables persistence.
    pub state_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 4840,
            max_workers: 50,
            inactivity_timeout_secs: 30,
            max_header_lines: 200,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
            state_file: None,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require credentials on every request.
    pub enabled: bool,

    /// Accepted user name.
    pub username: String,

    /// Accepted password.
    pub password: String,

    /// Realm advertised in the `WWW-Authenticate` challenge.
    pub realm: String,

    /// Lifetime of single-use access tokens in seconds.
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: "admin".to_string(),
            // WARNING: This is a placeholder! Change this in production.
            password: "CHANGE_ME".to_string(),
            realm: "netplane".to_string(),
            token_ttl_secs: 10,
        }
    }
}

/// WebSocket configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// How long a locally initiated close waits for the peer's close frame.
    pub close_timeout_ms: u64,

    /// Largest frame or reassembled message accepted.
    pub max_payload_bytes: u64,

    /// Timeout for the client-side upgrade exchange.
    pub handshake_timeout_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            close_timeout_ms: 1000,
            max_payload_bytes: 16 * 1024 * 1024,
            handshake_timeout_secs: 10,
        }
    }
}

/// JSON-RPC configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// A call without a reply after this long is marked timed out.
    pub timeout_ms: u64,

    /// Upper bound on how long cancellation waits for the worker to let go.
    pub cancel_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            cancel_timeout_ms: 1000,
        }
    }
}

/// Peer discovery and negotiation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Enable discovery and the peer directory.
    pub enabled: bool,

    /// Human readable name advertised to peers.
    pub name: String,

    /// Election priority. Higher priority instances initiate connections.
    pub priority: i64,

    /// Delay before a failed connect or identity query is retried.
    pub retry_interval_secs: u64,

    /// Timeout for the HTTP identity query.
    pub identity_timeout_secs: u64,

    /// UDP port used for discovery beacons.
    pub discovery_port: u16,

    /// IPv4 multicast group for discovery beacons.
    pub multicast_group: String,

    /// Beacon period in seconds.
    pub beacon_interval_secs: u64,

    /// A peer not heard from for this long has gone away.
    pub peer_timeout_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "netplane".to_string(),
            priority: 0,
            retry_interval_secs: 10,
            identity_timeout_secs: 5,
            discovery_port: 45678,
            multicast_group: "239.255.60.61".to_string(),
            beacon_interval_secs: 4,
            peer_timeout_secs: 16,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: NetplaneConfig = toml::from_str(
            r#"
            [server]
            port = 6547

            [peers]
            priority = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 6547);
        assert_eq!(config.server.max_workers, 50);
        assert_eq!(config.server.inactivity_timeout_secs, 30);
        assert_eq!(config.peers.priority, 5);
        assert_eq!(config.peers.retry_interval_secs, 10);
        assert_eq!(config.auth.token_ttl_secs, 10);
    }
}
