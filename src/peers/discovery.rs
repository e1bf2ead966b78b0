//! LAN discovery over UDP multicast.
//!
//! # Responsibilities
//! - Periodically announce our details while the server is advertised
//! - Say goodbye when the advertisement is withdrawn
//! - Turn other instances' beacons into discovery events
//! - Report instances that stop beaconing as gone
//!
//! # Design Decisions
//! - Discovery only produces events; it never touches the directory directly
//! - Beacons are JSON so other implementations can speak them without our types
//! - Our own beacons come back through multicast loopback and are filtered by uuid

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::identity::PeerDetails;
use crate::config::PeerConfig;
use crate::lifecycle::Shutdown;

/// Something that publishes this instance to the network.
pub trait Advertiser: Send + Sync {
    fn advertise(&self, details: PeerDetails);
    fn withdraw(&self);
}

/// What discovery learned about a peer. Identity fields may be missing
/// when the mechanism only carries an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub uuid: String,
    pub name: Option<String>,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub priority: Option<i64>,
    pub start_time: Option<u64>,
    pub api_version: Option<String>,
}

impl DiscoveryRecord {
    /// A record with only an address.
    pub fn bare(uuid: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            uuid: uuid.into(),
            name: None,
            addresses: vec![address],
            port,
            priority: None,
            start_time: None,
            api_version: None,
        }
    }

    pub fn from_details(details: PeerDetails, address: IpAddr) -> Self {
        Self {
            uuid: details.uuid,
            name: Some(details.name),
            addresses: vec![address],
            port: details.port,
            priority: Some(details.priority),
            start_time: Some(details.starttime),
            api_version: Some(details.apiversion),
        }
    }

    /// Whether the election inputs are all known.
    pub fn has_identity(&self) -> bool {
        self.priority.is_some() && self.start_time.is_some() && self.api_version.is_some()
    }

    /// Fill identity fields from a details query.
    pub fn apply_details(&mut self, details: &PeerDetails) {
        self.name = Some(details.name.clone());
        self.priority = Some(details.priority);
        self.start_time = Some(details.starttime);
        self.api_version = Some(details.apiversion.clone());
        if details.port != 0 {
            self.port = details.port;
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if self.port == 0 {
            return None;
        }
        self.addresses.first().map(|ip| SocketAddr::new(*ip, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Discovered(DiscoveryRecord),
    WentAway { uuid: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Beacon {
    Announce(PeerDetails),
    Goodbye { uuid: String },
}

/// UDP multicast advertiser and listener.
pub struct MulticastDiscovery {
    advertised: watch::Sender<Option<PeerDetails>>,
}

impl Advertiser for MulticastDiscovery {
    fn advertise(&self, details: PeerDetails) {
        tracing::info!(uuid = %details.uuid, port = details.port, "Advertising on LAN");
        self.advertised.send_replace(Some(details));
    }

    fn withdraw(&self) {
        tracing::info!("Withdrawing LAN advertisement");
        self.advertised.send_replace(None);
    }
}

impl MulticastDiscovery {
    /// Join the multicast group and start the beacon, receive and timeout tasks.
    pub async fn start(
        config: &PeerConfig,
        local_uuid: String,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
        shutdown: &Shutdown,
    ) -> std::io::Result<Arc<Self>> {
        let group: Ipv4Addr = config
            .multicast_group
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let socket = Arc::new(multicast_socket(group, config.discovery_port)?);
        let destination = SocketAddr::new(IpAddr::V4(group), config.discovery_port);
        let (advertised, watcher) = watch::channel(None);

        let beacon_interval = Duration::from_secs(config.beacon_interval_secs.max(1));
        let peer_timeout = Duration::from_secs(config.peer_timeout_secs.max(1));
        let seen = Arc::new(std::sync::Mutex::new(HashMap::new()));

        tokio::spawn(beacon_loop(
            Arc::clone(&socket),
            destination,
            watcher,
            beacon_interval,
            shutdown.subscribe(),
        ));
        tokio::spawn(receive_loop(
            socket,
            local_uuid,
            Arc::clone(&seen),
            events.clone(),
            shutdown.subscribe(),
        ));
        tokio::spawn(timeout_loop(seen, events, beacon_interval, peer_timeout, shutdown.subscribe()));

        tracing::info!(group = %group, port = config.discovery_port, "LAN discovery started");
        Ok(Arc::new(Self { advertised }))
    }
}

fn multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

async fn send_beacon(socket: &UdpSocket, destination: SocketAddr, beacon: &Beacon) {
    match serde_json::to_vec(beacon) {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, destination).await {
                tracing::debug!(error = %e, "Beacon send failed");
            }
        }
        Err(e) => tracing::error!(error = %e, "Beacon encoding failed"),
    }
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    mut advertised: watch::Receiver<Option<PeerDetails>>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut last_uuid: Option<String> = None;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = advertised.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }

        let current = advertised.borrow_and_update().clone();
        match current {
            Some(details) => {
                last_uuid = Some(details.uuid.clone());
                send_beacon(&socket, destination, &Beacon::Announce(details)).await;
            }
            None => {
                if let Some(uuid) = last_uuid.take() {
                    send_beacon(&socket, destination, &Beacon::Goodbye { uuid }).await;
                }
            }
        }
    }

    if let Some(uuid) = last_uuid {
        send_beacon(&socket, destination, &Beacon::Goodbye { uuid }).await;
    }
}

type SeenPeers = Arc<std::sync::Mutex<HashMap<String, (Instant, DiscoveryRecord)>>>;

fn lock(seen: &SeenPeers) -> std::sync::MutexGuard<'_, HashMap<String, (Instant, DiscoveryRecord)>> {
    seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    local_uuid: String,
    seen: SeenPeers,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        let (n, from) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "Discovery receive failed");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    continue;
                }
            },
            _ = shutdown.recv() => break,
        };

        let beacon: Beacon = match serde_json::from_slice(&buf[..n]) {
            Ok(beacon) => beacon,
            Err(e) => {
                tracing::trace!(from = %from, error = %e, "Ignoring foreign datagram");
                continue;
            }
        };

        let event = match beacon {
            Beacon::Announce(details) if details.uuid != local_uuid => {
                let record = DiscoveryRecord::from_details(details, from.ip());
                let mut seen = lock(&seen);
                let changed = seen.get(&record.uuid).map(|(_, r)| r != &record).unwrap_or(true);
                seen.insert(record.uuid.clone(), (Instant::now(), record.clone()));
                changed.then_some(DiscoveryEvent::Discovered(record))
            }
            Beacon::Goodbye { uuid } if uuid != local_uuid => {
                let known = lock(&seen).remove(&uuid).is_some();
                known.then_some(DiscoveryEvent::WentAway { uuid })
            }
            _ => None,
        };

        if let Some(event) = event {
            tracing::debug!(from = %from, event = ?event, "Discovery event");
            if events.send(event).is_err() {
                break;
            }
        }
    }
}

async fn timeout_loop(
    seen: SeenPeers,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    period: Duration,
    peer_timeout: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.recv() => break,
        }
        let expired: Vec<String> = {
            let mut seen = lock(&seen);
            let now = Instant::now();
            let expired: Vec<String> = seen
                .iter()
                .filter(|(_, (last, _))| now.duration_since(*last) >= peer_timeout)
                .map(|(uuid, _)| uuid.clone())
                .collect();
            for uuid in &expired {
                seen.remove(uuid);
            }
            expired
        };
        for uuid in expired {
            tracing::info!(uuid = %uuid, "Peer stopped beaconing");
            if events.send(DiscoveryEvent::WentAway { uuid }).is_err() {
                return;
            }
        }
    }
}
