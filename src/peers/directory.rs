//! The peer directory.
//!
//! # Responsibilities
//! - Track every peer discovery reports, minus ourselves
//! - Fill in missing identity with a details query
//! - Run the election and open links where we are the initiator
//! - Adopt links peers open to us
//! - Retry failed queries and connects, one pending retry per peer
//!
//! # Design Decisions
//! - A single task owns the peer table; everything else sends it events
//! - Other tasks read a published snapshot behind a mutex, never the live table
//! - Identity queries and connects run on their own tasks and report back as events

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use super::discovery::{DiscoveryEvent, DiscoveryRecord};
use super::election::{negotiate, Candidate, LinkRole};
use super::identity::{IdentityClient, PeerDetails};
use crate::context::ServerContext;
use crate::net::ConnectionId;
use crate::observability::metrics;
use crate::websocket::{self, close_code, WebSocketHandle};

/// Path peers upgrade on when they open a link.
pub const LINK_PATH: &str = "/";

/// Read-only view of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub uuid: String,
    pub name: Option<String>,
    pub addresses: Vec<String>,
    pub port: u16,
    pub priority: Option<i64>,
    pub starttime: Option<u64>,
    pub apiversion: Option<String>,
    pub connected: bool,
}

#[derive(Debug, Clone)]
struct Published {
    summary: PeerSummary,
    link: Option<WebSocketHandle>,
}

type PublishedTable = Arc<Mutex<BTreeMap<String, Published>>>;

enum Event {
    Discovery(DiscoveryEvent),
    Incoming {
        uuid: String,
        address: IpAddr,
        port: Option<u16>,
        handle: WebSocketHandle,
    },
    Identity {
        uuid: String,
        result: Result<PeerDetails, String>,
    },
    Connected {
        uuid: String,
        result: Result<WebSocketHandle, String>,
    },
    Disconnected {
        uuid: String,
        id: ConnectionId,
    },
    Retry {
        uuid: String,
    },
}

/// Cloneable access to the directory task.
#[derive(Clone)]
pub struct PeerDirectoryHandle {
    events: mpsc::UnboundedSender<Event>,
    published: PublishedTable,
}

impl PeerDirectoryHandle {
    /// Hand over a link a peer opened to us.
    pub fn incoming(&self, uuid: String, address: IpAddr, port: Option<u16>, handle: WebSocketHandle) {
        let event = Event::Incoming {
            uuid,
            address,
            port,
            handle,
        };
        if let Err(mpsc::error::SendError(Event::Incoming { handle, .. })) = self.events.send(event) {
            handle.close(close_code::GOING_AWAY, "Peer directory stopped");
        }
    }

    /// Feed a discovery event directly, bypassing the discovery channel.
    pub fn discovered(&self, event: DiscoveryEvent) {
        let _ = self.events.send(Event::Discovery(event));
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.lock().values().map(|p| p.summary.clone()).collect()
    }

    pub fn peer(&self, uuid: &str) -> Option<PeerSummary> {
        self.lock().get(uuid).map(|p| p.summary.clone())
    }

    /// The live link to `uuid`, if any.
    pub fn link(&self, uuid: &str) -> Option<WebSocketHandle> {
        self.lock()
            .get(uuid)
            .and_then(|p| p.link.clone())
            .filter(|l| !l.is_closed())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Published>> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PeerDirectoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDirectoryHandle").finish_non_exhaustive()
    }
}

struct Peer {
    record: DiscoveryRecord,
    link: Option<WebSocketHandle>,
    identity_pending: bool,
    connecting: bool,
    retry_scheduled: bool,
}

impl Peer {
    fn new(record: DiscoveryRecord) -> Self {
        Self {
            record,
            link: None,
            identity_pending: false,
            connecting: false,
            retry_scheduled: false,
        }
    }

    fn is_linked(&self) -> bool {
        self.link.as_ref().is_some_and(|l| !l.is_closed())
    }

    fn summary(&self) -> PeerSummary {
        PeerSummary {
            uuid: self.record.uuid.clone(),
            name: self.record.name.clone(),
            addresses: self.record.addresses.iter().map(|a| a.to_string()).collect(),
            port: self.record.port,
            priority: self.record.priority,
            starttime: self.record.start_time,
            apiversion: self.record.api_version.clone(),
            connected: self.is_linked(),
        }
    }
}

struct PeerDirectory {
    context: Arc<ServerContext>,
    identity: Option<IdentityClient>,
    peers: BTreeMap<String, Peer>,
    events: mpsc::UnboundedSender<Event>,
    published: PublishedTable,
    retry_interval: Duration,
}

/// Start the directory task. Discovery events arrive on `discovery`.
pub fn spawn(
    context: Arc<ServerContext>,
    mut discovery: mpsc::UnboundedReceiver<DiscoveryEvent>,
) -> PeerDirectoryHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let published: PublishedTable = Arc::new(Mutex::new(BTreeMap::new()));
    let handle = PeerDirectoryHandle {
        events: tx.clone(),
        published: Arc::clone(&published),
    };

    let retry_interval = Duration::from_secs(context.config().peers.retry_interval_secs);
    let identity = match IdentityClient::new(
        &context.config().auth,
        Duration::from_secs(context.config().peers.identity_timeout_secs),
    ) {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::error!(error = %e, "Identity client unavailable; peers without details cannot be linked");
            None
        }
    };
    let mut directory = PeerDirectory {
        retry_interval,
        identity,
        peers: BTreeMap::new(),
        events: tx,
        published,
        context,
    };

    tokio::spawn(async move {
        let mut shutdown = directory.context.shutdown().subscribe();
        let mut discovery_open = true;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => directory.handle(event),
                    None => break,
                },
                event = discovery.recv(), if discovery_open => match event {
                    Some(event) => directory.handle(Event::Discovery(event)),
                    None => discovery_open = false,
                },
                _ = shutdown.recv() => break,
            }
        }
        directory.close_all();
        tracing::info!("Peer directory stopped");
    });

    handle
}

impl PeerDirectory {
    fn handle(&mut self, event: Event) {
        match event {
            Event::Discovery(DiscoveryEvent::Discovered(record)) => self.on_discovered(record),
            Event::Discovery(DiscoveryEvent::WentAway { uuid }) => self.on_went_away(&uuid),
            Event::Incoming {
                uuid,
                address,
                port,
                handle,
            } => self.on_incoming(uuid, address, port, handle),
            Event::Identity { uuid, result } => self.on_identity(&uuid, result),
            Event::Connected { uuid, result } => self.on_connected(&uuid, result),
            Event::Disconnected { uuid, id } => self.on_disconnected(&uuid, id),
            Event::Retry { uuid } => {
                if let Some(peer) = self.peers.get_mut(&uuid) {
                    peer.retry_scheduled = false;
                    self.connect(&uuid);
                }
            }
        }
        self.publish();
    }

    fn is_self(&self, uuid: &str) -> bool {
        uuid == self.context.identity().uuid
    }

    fn on_discovered(&mut self, record: DiscoveryRecord) {
        if self.is_self(&record.uuid) {
            return;
        }
        let uuid = record.uuid.clone();
        match self.peers.get_mut(&uuid) {
            Some(peer) => {
                // Keep identity we already fetched if this report lacks it.
                let mut merged = record;
                if !merged.has_identity() && peer.record.has_identity() {
                    merged.name = peer.record.name.clone();
                    merged.priority = peer.record.priority;
                    merged.start_time = peer.record.start_time;
                    merged.api_version = peer.record.api_version.clone();
                }
                peer.record = merged;
            }
            None => {
                tracing::info!(
                    uuid = %uuid,
                    addresses = ?record.addresses,
                    port = record.port,
                    "Peer discovered"
                );
                self.peers.insert(uuid.clone(), Peer::new(record));
            }
        }
        self.connect(&uuid);
    }

    fn on_went_away(&mut self, uuid: &str) {
        if let Some(peer) = self.peers.remove(uuid) {
            tracing::info!(uuid = %uuid, "Peer went away");
            if let Some(link) = peer.link {
                link.close(close_code::GOING_AWAY, "Peer went away");
            }
        }
    }

    fn on_incoming(&mut self, uuid: String, address: IpAddr, port: Option<u16>, handle: WebSocketHandle) {
        if self.is_self(&uuid) {
            tracing::warn!(remote = %handle.remote(), "Refusing a link from ourselves");
            handle.close(close_code::POLICY_VIOLATION, "Self link");
            return;
        }

        let peer = self.peers.entry(uuid.clone()).or_insert_with(|| {
            tracing::info!(uuid = %uuid, address = %address, "Undiscovered peer connected");
            Peer::new(DiscoveryRecord::bare(uuid.clone(), address, port.unwrap_or(0)))
        });
        if peer.record.port == 0 {
            if let Some(port) = port {
                peer.record.port = port;
            }
        }
        if peer.is_linked() {
            tracing::debug!(uuid = %uuid, "Duplicate peer link refused");
            handle.close(close_code::POLICY_VIOLATION, "Already linked");
            return;
        }

        tracing::info!(uuid = %uuid, connection_id = %handle.id(), "Peer linked (incoming)");
        self.adopt(&uuid, handle);
    }

    fn on_identity(&mut self, uuid: &str, result: Result<PeerDetails, String>) {
        let Some(peer) = self.peers.get_mut(uuid) else {
            return;
        };
        peer.identity_pending = false;
        match result {
            Ok(details) => {
                peer.record.apply_details(&details);
                self.connect(uuid);
            }
            Err(e) => {
                tracing::warn!(uuid = %uuid, error = %e, "Peer identity query failed");
                self.schedule_retry(uuid);
            }
        }
    }

    fn on_connected(&mut self, uuid: &str, result: Result<WebSocketHandle, String>) {
        let Some(peer) = self.peers.get_mut(uuid) else {
            if let Ok(handle) = result {
                handle.close(close_code::NORMAL, "Peer went away");
            }
            return;
        };
        peer.connecting = false;
        match result {
            Ok(handle) if peer.is_linked() => {
                tracing::debug!(uuid = %uuid, "Peer linked while connecting; dropping ours");
                handle.close(close_code::NORMAL, "Already linked");
            }
            Ok(handle) => {
                tracing::info!(uuid = %uuid, connection_id = %handle.id(), "Peer linked (outgoing)");
                self.adopt(uuid, handle);
            }
            Err(e) => {
                tracing::warn!(uuid = %uuid, error = %e, "Peer connect failed");
                self.schedule_retry(uuid);
            }
        }
    }

    fn on_disconnected(&mut self, uuid: &str, id: ConnectionId) {
        let Some(peer) = self.peers.get_mut(uuid) else {
            return;
        };
        if peer.link.as_ref().map(|l| l.id()) != Some(id) {
            return;
        }
        peer.link = None;
        tracing::info!(uuid = %uuid, connection_id = %id, "Peer link closed");
        if !self.context.shutdown().is_triggered() {
            self.schedule_retry(uuid);
        }
    }

    fn adopt(&mut self, uuid: &str, handle: WebSocketHandle) {
        let Some(peer) = self.peers.get_mut(uuid) else {
            return;
        };
        let events = self.events.clone();
        let watched = handle.clone();
        let key = uuid.to_string();
        tokio::spawn(async move {
            watched.closed().await;
            let _ = events.send(Event::Disconnected {
                uuid: key,
                id: watched.id(),
            });
        });
        peer.link = Some(handle);
    }

    /// Bring the link to `uuid` up if that is our job.
    fn connect(&mut self, uuid: &str) {
        let local = self.context.identity();
        let Some(peer) = self.peers.get_mut(uuid) else {
            return;
        };
        if peer.is_linked() || peer.connecting || peer.identity_pending {
            return;
        }
        let Some(addr) = peer.record.socket_addr() else {
            tracing::debug!(uuid = %uuid, "Peer has no reachable address yet");
            return;
        };

        if !peer.record.has_identity() {
            let Some(client) = self.identity.clone() else {
                return;
            };
            peer.identity_pending = true;
            let events = self.events.clone();
            let key = uuid.to_string();
            tokio::spawn(async move {
                let result = client.fetch(addr, &key).await.map_err(|e| e.to_string());
                let _ = events.send(Event::Identity { uuid: key, result });
            });
            return;
        }

        let remote = Candidate {
            uuid,
            priority: peer.record.priority.unwrap_or_default(),
            start_time: peer.record.start_time.unwrap_or_default(),
        };
        let ours = Candidate {
            uuid: &local.uuid,
            priority: local.priority,
            start_time: local.start_time,
        };
        if negotiate(ours, remote) == LinkRole::Wait {
            tracing::debug!(uuid = %uuid, "Waiting for peer to connect");
            return;
        }

        peer.connecting = true;
        tracing::debug!(uuid = %uuid, address = %addr, "Connecting to peer");
        let events = self.events.clone();
        let context = Arc::clone(&self.context);
        let key = uuid.to_string();
        tokio::spawn(async move {
            let result = websocket::connect(context, addr, LINK_PATH)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(Event::Connected { uuid: key, result });
        });
    }

    /// At most one retry per peer is ever pending.
    fn schedule_retry(&mut self, uuid: &str) {
        let Some(peer) = self.peers.get_mut(uuid) else {
            return;
        };
        if peer.retry_scheduled {
            return;
        }
        peer.retry_scheduled = true;
        let events = self.events.clone();
        let delay = self.retry_interval;
        let key = uuid.to_string();
        tracing::debug!(uuid = %uuid, delay_secs = delay.as_secs(), "Peer retry scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Retry { uuid: key });
        });
    }

    fn publish(&self) {
        let table: BTreeMap<String, Published> = self
            .peers
            .iter()
            .map(|(uuid, peer)| {
                (
                    uuid.clone(),
                    Published {
                        summary: peer.summary(),
                        link: peer.link.clone(),
                    },
                )
            })
            .collect();
        let connected = table.values().filter(|p| p.summary.connected).count();
        metrics::record_peers(table.len(), connected);
        *self.published.lock().unwrap_or_else(PoisonError::into_inner) = table;
    }

    fn close_all(&mut self) {
        for (uuid, peer) in std::mem::take(&mut self.peers) {
            if let Some(link) = peer.link {
                tracing::debug!(uuid = %uuid, "Closing peer link");
                link.close(close_code::GOING_AWAY, "Shutting down");
            }
        }
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetplaneConfig;

    fn record(uuid: &str, port: u16) -> DiscoveryRecord {
        DiscoveryRecord {
            uuid: uuid.to_string(),
            name: Some("other".into()),
            addresses: vec!["127.0.0.1".parse().unwrap()],
            port,
            priority: Some(i64::MAX),
            start_time: Some(0),
            api_version: Some("1.0.0".into()),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn tracks_and_forgets_peers() {
        let context = ServerContext::new(NetplaneConfig::default());
        let (_tx, rx) = mpsc::unbounded_channel();
        let directory = spawn(Arc::clone(&context), rx);

        // Highest possible priority: the peer initiates, so nothing dials out.
        directory.discovered(DiscoveryEvent::Discovered(record("peer-a", 4900)));
        settle().await;
        let peers = directory.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].uuid, "peer-a");
        assert!(!peers[0].connected);

        directory.discovered(DiscoveryEvent::WentAway { uuid: "peer-a".into() });
        settle().await;
        assert!(directory.peers().is_empty());
    }

    #[tokio::test]
    async fn ignores_ourselves() {
        let context = ServerContext::new(NetplaneConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let directory = spawn(Arc::clone(&context), rx);

        tx.send(DiscoveryEvent::Discovered(record(&context.identity().uuid, 4900)))
            .unwrap();
        settle().await;
        assert!(directory.peers().is_empty());
    }
}
