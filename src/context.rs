//! Process-wide server state.
//!
//! # Responsibilities
//! - Own the configuration, identity, handler registry and auth tokens
//! - Publish the bound port once the listener is up
//! - Link the optional peer directory and discovery advertiser
//!
//! # Design Decisions
//! - Shared as `Arc<ServerContext>`; everything inside is immutable or internally synchronised
//! - The directory and advertiser are set once after construction, so neither
//!   needs to exist for the HTTP side to work

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::{NetplaneConfig, StateStore};
use crate::http::auth::Authenticator;
use crate::http::ReaderLimits;
use crate::lifecycle::Shutdown;
use crate::net::ConnectionTracker;
use crate::peers::discovery::Advertiser;
use crate::peers::identity::{LocalIdentity, PeerDetails};
use crate::peers::PeerDirectoryHandle;
use crate::routing::{Handler, HandlerRegistry};

pub struct ServerContext {
    config: NetplaneConfig,
    identity: LocalIdentity,
    port: AtomicU16,
    registry: HandlerRegistry,
    auth: Authenticator,
    shutdown: Arc<Shutdown>,
    connections: ConnectionTracker,
    state: StateStore,
    peers: OnceLock<PeerDirectoryHandle>,
    advertiser: OnceLock<Arc<dyn Advertiser>>,
}

impl ServerContext {
    pub fn new(config: NetplaneConfig) -> Arc<Self> {
        let identity = LocalIdentity::new(&config.peers);
        tracing::info!(
            uuid = %identity.uuid,
            name = %identity.name,
            priority = identity.priority,
            start_time = identity.start_time,
            "Local identity"
        );
        Arc::new(Self {
            auth: Authenticator::new(config.auth.clone()),
            state: StateStore::new(config.server.state_file.as_deref()),
            port: AtomicU16::new(0),
            registry: HandlerRegistry::new(),
            shutdown: Arc::new(Shutdown::new()),
            connections: ConnectionTracker::new(),
            peers: OnceLock::new(),
            advertiser: OnceLock::new(),
            identity,
            config,
        })
    }

    pub fn config(&self) -> &NetplaneConfig {
        &self.config
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// The bound listener port; 0 until the server is listening.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub(crate) fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst);
    }

    /// Our advertised details.
    pub fn details(&self) -> PeerDetails {
        self.identity.details(self.port())
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn register(&self, handler: Arc<dyn Handler>) -> bool {
        self.registry.register(handler)
    }

    pub fn auth(&self) -> &Authenticator {
        &self.auth
    }

    pub fn shutdown(&self) -> &Arc<Shutdown> {
        &self.shutdown
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub fn reader_limits(&self) -> ReaderLimits {
        ReaderLimits {
            max_header_lines: self.config.server.max_header_lines,
            max_body_bytes: self.config.server.max_body_bytes,
        }
    }

    pub fn peers(&self) -> Option<&PeerDirectoryHandle> {
        self.peers.get()
    }

    /// Link the peer directory. Returns false if one is already linked.
    pub fn attach_peers(&self, handle: PeerDirectoryHandle) -> bool {
        self.peers.set(handle).is_ok()
    }

    pub fn advertiser(&self) -> Option<&Arc<dyn Advertiser>> {
        self.advertiser.get()
    }

    pub fn attach_advertiser(&self, advertiser: Arc<dyn Advertiser>) -> bool {
        self.advertiser.set(advertiser).is_ok()
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext").finish_non_exhaustive()
    }
}
