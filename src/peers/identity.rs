//! Who we are, and how to ask a peer who it is.
//!
//! # Responsibilities
//! - Generate the local identity once per process
//! - Describe an instance in the form shared by beacons and `GetDetails`
//! - Fetch a peer's details over HTTP when discovery did not carry them

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::{AuthConfig, PeerConfig};
use crate::http::auth::basic_header;

/// Version of the peer-facing API.
pub const API_VERSION: &str = "1.0.0";

/// Path of the details method on every instance.
pub const DETAILS_PATH: &str = "/services/network/GetDetails";

/// Identity of this process. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub uuid: String,
    pub name: String,
    pub priority: i64,
    /// Seconds since the Unix epoch.
    pub start_time: u64,
    pub api_version: &'static str,
}

impl LocalIdentity {
    pub fn new(config: &PeerConfig) -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: config.name.clone(),
            priority: config.priority,
            start_time,
            api_version: API_VERSION,
        }
    }

    pub fn details(&self, port: u16) -> PeerDetails {
        PeerDetails {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            port,
            priority: self.priority,
            starttime: self.start_time,
            apiversion: self.api_version.to_string(),
        }
    }
}

/// The identity fields an instance advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDetails {
    pub uuid: String,
    pub name: String,
    pub port: u16,
    pub priority: i64,
    pub starttime: u64,
    pub apiversion: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Peer answered with status {0}")]
    Status(u16),
    #[error("Peer reported uuid {actual}, expected {expected}")]
    UuidMismatch { expected: String, actual: String },
}

#[derive(Deserialize)]
struct DetailsEnvelope {
    details: PeerDetails,
}

/// Queries peer identities over HTTP.
#[derive(Debug, Clone)]
pub struct IdentityClient {
    client: reqwest::Client,
    authorization: Option<String>,
}

impl IdentityClient {
    pub fn new(auth: &AuthConfig, timeout: Duration) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder().timeout(timeout).no_proxy().build()?;
        let authorization = auth
            .enabled
            .then(|| basic_header(&auth.username, &auth.password));
        Ok(Self { client, authorization })
    }

    /// Fetch the details of the instance listening at `addr`, which discovery
    /// reported as `expected_uuid`.
    pub async fn fetch(&self, addr: SocketAddr, expected_uuid: &str) -> Result<PeerDetails, IdentityError> {
        let url = format!("http://{addr}{DETAILS_PATH}");
        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(auth) = &self.authorization {
            request = request.header("Authorization", auth);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(IdentityError::Status(response.status().as_u16()));
        }
        let envelope: DetailsEnvelope = response.json().await?;
        if envelope.details.uuid != expected_uuid {
            return Err(IdentityError::UuidMismatch {
                expected: expected_uuid.to_string(),
                actual: envelope.details.uuid,
            });
        }
        tracing::debug!(
            peer = %addr,
            uuid = %envelope.details.uuid,
            priority = envelope.details.priority,
            "Fetched peer identity"
        );
        Ok(envelope.details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_use_the_bound_port() {
        let identity = LocalIdentity::new(&PeerConfig::default());
        let details = identity.details(50123);
        assert_eq!(details.port, 50123);
        assert_eq!(details.uuid, identity.uuid);
        assert_eq!(details.apiversion, API_VERSION);
        assert!(uuid::Uuid::parse_str(&details.uuid).is_ok());
    }

    #[test]
    fn details_envelope_shape() {
        let json = r#"{"details":{"uuid":"u","name":"n","port":1,"priority":2,"starttime":3,"apiversion":"1.0.0"}}"#;
        let env: DetailsEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.details.priority, 2);
    }

    /// Answer one HTTP request with `details` for uuid "someone-else".
    async fn impostor() -> SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await.unwrap();
            let body = r#"{"details":{"uuid":"someone-else","name":"n","port":1,"priority":2,"starttime":3,"apiversion":"1.0.0"}}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn rejects_details_for_another_uuid() {
        let client = IdentityClient::new(&AuthConfig::default(), Duration::from_secs(5)).unwrap();
        let addr = impostor().await;
        match client.fetch(addr, "expected-uuid").await {
            Err(IdentityError::UuidMismatch { expected, actual }) => {
                assert_eq!(expected, "expected-uuid");
                assert_eq!(actual, "someone-else");
            }
            other => panic!("expected a uuid mismatch, got {other:?}"),
        }
    }
}
