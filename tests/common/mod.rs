//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use netplane::config::NetplaneConfig;
use netplane::lifecycle::{DiscoverySource, Instance};
use netplane::peers::DiscoveryEvent;
use netplane::ServerContext;

pub const USER: &str = "tester";
pub const PASSWORD: &str = "s3cret";

/// A running server on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub context: Arc<ServerContext>,
    pub discovery: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn uuid(&self) -> String {
        self.context.identity().uuid.clone()
    }

    pub fn stop(&self) {
        self.context.shutdown().trigger();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Loopback config with peers off.
pub fn config() -> NetplaneConfig {
    let mut config = NetplaneConfig::default();
    config.server.bind_host = "127.0.0.1".into();
    config.server.port = 0;
    config.server.state_file = None;
    config.peers.enabled = false;
    config
}

pub fn auth_config() -> NetplaneConfig {
    let mut config = config();
    config.auth.enabled = true;
    config.auth.username = USER.into();
    config.auth.password = PASSWORD.into();
    config.auth.realm = "netplane-test".into();
    config
}

/// Config for an instance whose discovery events the test supplies.
pub fn peer_config(name: &str, priority: i64) -> NetplaneConfig {
    let mut config = config();
    config.peers.enabled = true;
    config.peers.name = name.into();
    config.peers.priority = priority;
    config.peers.retry_interval_secs = 1;
    config.peers.identity_timeout_secs = 2;
    config
}

pub async fn start(config: NetplaneConfig) -> TestServer {
    let (tx, rx) = mpsc::unbounded_channel();
    let peers = config.peers.enabled;
    let instance = Instance::start(config, DiscoverySource::Channel(rx))
        .await
        .expect("instance starts");
    let addr = instance.local_addr().expect("bound address");
    let context = Arc::clone(instance.context());
    tokio::spawn(instance.run());
    TestServer {
        addr,
        context,
        discovery: peers.then_some(tx),
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
