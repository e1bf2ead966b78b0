//! HTTP server: accept loop and per-connection workers.
//!
//! # Responsibilities
//! - Bind the listener (preferred port, ephemeral fallback) and persist the result
//! - Advertise on bind, withdraw on shutdown
//! - Serve keep-alive connections, one worker each
//! - Hand upgraded sockets to the WebSocket engine
//! - Sweep expired access tokens
//!
//! # Design Decisions
//! - Worker slots are semaphore permits; a WebSocket gives its slot back
//! - Reads are bounded by the inactivity timeout
//! - Malformed input closes the connection without a response

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::reader::{read_message, HttpReader, ReadError};
use super::request::{ConnectionMode, Request};
use super::response::render;
use crate::config::PersistedState;
use crate::context::ServerContext;
use crate::net::{ConnectionGuard, ConnectionKind, Listener, ListenerError, WorkerPermit};
use crate::observability::metrics;
use crate::routing::{dispatch, Dispatch};
use crate::websocket;

/// Drain budget for open connections at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpServer {
    context: Arc<ServerContext>,
}

impl HttpServer {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Bind the listener and record the port.
    pub async fn bind(&self) -> Result<Listener, ListenerError> {
        let server = &self.context.config().server;
        let store = self.context.state_store();
        let preferred = store.load().preferred_port(server.port);

        let listener = Listener::bind(&server.bind_host, preferred, server.max_workers).await?;
        let port = listener.local_addr().map_err(ListenerError::Bind)?.port();
        self.context.set_port(port);

        let state = PersistedState {
            port: Some(port),
            configured_port: Some(server.port),
        };
        if let Err(e) = store.save(&state) {
            tracing::warn!(path = ?store.path(), error = %e, "Failed to persist listener port");
        }
        Ok(listener)
    }

    /// Run the accept loop until shutdown.
    pub async fn run(self, listener: Listener) -> Result<(), ListenerError> {
        let context = self.context;
        let addr = listener.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(address = %addr, "HTTP server starting");

        if let Some(advertiser) = context.advertiser() {
            advertiser.advertise(context.details());
        }
        spawn_token_sweeper(Arc::clone(&context));

        let mut shutdown = context.shutdown().subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote, permit)) => {
                        let guard = context.connections().track(ConnectionKind::Http);
                        tokio::spawn(serve_connection(Arc::clone(&context), stream, remote, permit, guard));
                    }
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => return Err(e),
                },
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!(address = %addr, "HTTP server stopping");
        if let Some(advertiser) = context.advertiser() {
            advertiser.withdraw();
        }
        drop(listener);

        if !context.connections().wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!(
                remaining = context.connections().active_count(),
                "Connections still open after drain timeout"
            );
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

fn spawn_token_sweeper(context: Arc<ServerContext>) {
    let period = context.auth().tokens().ttl().max(Duration::from_secs(1));
    let mut shutdown = context.shutdown().subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = context.auth().tokens().sweep();
                    if removed > 0 {
                        tracing::debug!(removed, "Expired access tokens swept");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}

/// Serve one connection until it closes, times out or upgrades.
async fn serve_connection(
    context: Arc<ServerContext>,
    mut stream: TcpStream,
    remote: SocketAddr,
    permit: WorkerPermit,
    guard: ConnectionGuard,
) {
    let id = guard.id();
    let inactivity = Duration::from_secs(context.config().server.inactivity_timeout_secs);
    let mut reader = HttpReader::new(context.reader_limits());
    let mut buffer = Vec::new();
    let mut shutdown = context.shutdown().subscribe();

    loop {
        let raw = tokio::select! {
            read = read_message(&mut stream, &mut reader, &mut buffer, inactivity) => read,
            _ = shutdown.recv() => break,
        };
        let raw = match raw {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::trace!(connection_id = %id, "Connection idle or closed");
                break;
            }
            Err(ReadError::Timeout) => {
                tracing::debug!(connection_id = %id, "Connection timed out mid-request");
                break;
            }
            Err(e) => {
                tracing::debug!(connection_id = %id, remote = %remote, error = %e, "Read failed");
                break;
            }
        };

        let start = Instant::now();
        let mut request = match Request::from_raw(raw, Some(remote)) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(connection_id = %id, remote = %remote, error = %e, "Malformed request");
                break;
            }
        };

        let outcome = dispatch(&context, &mut request);
        if context.shutdown().is_triggered() && outcome == Dispatch::Respond {
            request.set_connection(ConnectionMode::Close);
        }

        let bytes = render(&request);
        if let Err(e) = stream.write_all(&bytes).await {
            tracing::debug!(connection_id = %id, error = %e, "Write failed");
            break;
        }
        metrics::record_request(request.verb().as_str(), request.status().as_u16(), start);
        tracing::debug!(
            connection_id = %id,
            verb = %request.verb(),
            path = %request.path(),
            status = request.status().as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Request served"
        );

        if outcome == Dispatch::Upgrade {
            let echo = request.method().starts_with("echo");
            let ws_guard = context.connections().track_with_id(id, ConnectionKind::WebSocket);
            drop(guard);
            drop(permit);
            let handle = websocket::spawn_server(
                Arc::clone(&context),
                stream,
                remote,
                std::mem::take(&mut buffer),
                echo,
                request.principal().cloned(),
                ws_guard,
            );
            register_peer_link(&context, &request, handle);
            return;
        }

        if request.connection() == ConnectionMode::Close {
            break;
        }
    }

    let _ = stream.shutdown().await;
}

/// An upgrade carrying peer headers is a peer's link to us.
fn register_peer_link(context: &ServerContext, request: &Request, handle: websocket::WebSocketHandle) {
    let Some(uuid) = request.headers().get(websocket::handshake::PEER_UUID_HEADER) else {
        return;
    };
    let port = request
        .headers()
        .get(websocket::handshake::PEER_PORT_HEADER)
        .and_then(|p| p.trim().parse::<u16>().ok());
    match context.peers() {
        Some(peers) => peers.incoming(uuid.trim().to_string(), handle.remote().ip(), port, handle),
        None => tracing::debug!(uuid = %uuid, "Peer link without a peer directory"),
    }
}
