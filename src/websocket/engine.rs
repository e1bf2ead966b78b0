//! The task that owns an upgraded connection.
//!
//! # Responsibilities
//! - Pump bytes between the socket and the protocol state machine
//! - Deliver messages: echo, or JSON-RPC dispatch and reply routing
//! - Accept sends and closes from any task through a handle
//! - Bound the close handshake and react to server shutdown
//!
//! # Design Decisions
//! - One task per connection; the socket is never shared
//! - Everything else talks to the task over an unbounded command channel
//! - Handshake bytes read past the 101 are fed to the protocol first

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::frame::{close_code, OpCode};
use super::handshake::{self, HandshakeError, PEER_PORT_HEADER, PEER_UUID_HEADER};
use super::protocol::{Message, Role, WebSocketProtocol};
use crate::context::ServerContext;
use crate::http::auth::Principal;
use crate::http::reader::{read_message, HttpReader};
use crate::net::{ConnectionGuard, ConnectionId, ConnectionKind};
use crate::rpc::{self, RpcCorrelator};

const READ_CHUNK: usize = 16 * 1024;

/// Work handed to a connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Text(String),
    Binary(Vec<u8>),
    Close(u16, String),
}

/// Cloneable handle to a running connection.
#[derive(Clone)]
pub struct WebSocketHandle {
    id: ConnectionId,
    remote: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    rpc: Arc<RpcCorrelator>,
}

impl WebSocketHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Queue a text message. Returns false if the connection is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.commands.send(Command::Text(text.into())).is_ok()
    }

    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.commands.send(Command::Binary(data)).is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.commands.send(Command::Close(code, reason.to_string()));
    }

    pub fn rpc(&self) -> &Arc<RpcCorrelator> {
        &self.rpc
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Resolves once the connection task has finished.
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

impl std::fmt::Debug for WebSocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

pub struct WebSocketEngine {
    id: ConnectionId,
    remote: SocketAddr,
    stream: TcpStream,
    buffer: Vec<u8>,
    protocol: WebSocketProtocol,
    commands: mpsc::UnboundedReceiver<Command>,
    rpc: Arc<RpcCorrelator>,
    context: Arc<ServerContext>,
    shutdown: broadcast::Receiver<()>,
    echo: bool,
    principal: Option<Principal>,
    close_timeout: Duration,
    close_deadline: Option<Instant>,
    _guard: ConnectionGuard,
}

impl WebSocketEngine {
    /// Wrap an upgraded stream. `leftover` holds bytes read past the handshake.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<ServerContext>,
        stream: TcpStream,
        remote: SocketAddr,
        leftover: Vec<u8>,
        role: Role,
        echo: bool,
        principal: Option<Principal>,
        guard: ConnectionGuard,
    ) -> (Self, WebSocketHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = &context.config().websocket;
        let rpc = RpcCorrelator::new(
            guard.id(),
            tx.clone(),
            Duration::from_millis(context.config().rpc.timeout_ms),
        );
        let handle = WebSocketHandle {
            id: guard.id(),
            remote,
            commands: tx,
            rpc: Arc::clone(&rpc),
        };
        let engine = Self {
            id: guard.id(),
            remote,
            stream,
            buffer: leftover,
            protocol: WebSocketProtocol::new(role, config.max_payload_bytes),
            commands: rx,
            rpc,
            shutdown: context.shutdown().subscribe(),
            echo,
            principal,
            close_timeout: Duration::from_millis(config.close_timeout_ms),
            close_deadline: None,
            context,
            _guard: guard,
        };
        (engine, handle)
    }

    /// Run until the connection closes.
    pub async fn run(mut self) {
        tracing::info!(
            connection_id = %self.id,
            remote = %self.remote,
            role = ?self.protocol.role(),
            echo = self.echo,
            "WebSocket open"
        );

        let mut chunk = vec![0u8; READ_CHUNK];
        let mut shutting_down = false;
        self.process_input();

        loop {
            if let Err(e) = self.flush().await {
                tracing::debug!(connection_id = %self.id, error = %e, "WebSocket write failed");
                break;
            }
            if self.protocol.is_finished() {
                break;
            }
            if self.protocol.close_sent() && self.close_deadline.is_none() {
                self.close_deadline = Some(Instant::now() + self.close_timeout);
            }
            let deadline = self
                .close_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                read = self.stream.read(&mut chunk) => match read {
                    Ok(0) => {
                        tracing::debug!(connection_id = %self.id, "Peer closed the socket");
                        break;
                    }
                    Ok(n) => {
                        self.buffer.extend_from_slice(&chunk[..n]);
                        self.process_input();
                    }
                    Err(e) => {
                        tracing::warn!(connection_id = %self.id, error = %e, "WebSocket read failed");
                        self.protocol.initiate_close(close_code::UNEXPECTED_ERROR, "Read error");
                        let _ = self.flush().await;
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => self.protocol.initiate_close(close_code::GOING_AWAY, ""),
                },
                _ = tokio::time::sleep_until(deadline), if self.close_deadline.is_some() => {
                    tracing::debug!(connection_id = %self.id, "Close handshake timed out");
                    break;
                }
                _ = self.shutdown.recv(), if !shutting_down => {
                    shutting_down = true;
                    self.protocol.initiate_close(close_code::GOING_AWAY, "Server shutting down");
                }
            }
        }

        let _ = self.stream.shutdown().await;
        self.rpc.close("connection closed");
        self.commands.close();
        tracing::info!(
            connection_id = %self.id,
            remote = %self.remote,
            close_code = self.protocol.close_code(),
            "WebSocket closed"
        );
    }

    fn apply(&mut self, command: Command) {
        let result = match command {
            Command::Text(text) => self.protocol.send(OpCode::Text, text.as_bytes()),
            Command::Binary(data) => self.protocol.send(OpCode::Binary, &data),
            Command::Close(code, reason) => {
                self.protocol.initiate_close(code, &reason);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::debug!(connection_id = %self.id, error = %e, "Dropped outgoing message");
        }
    }

    fn process_input(&mut self) {
        for message in self.protocol.receive(&mut self.buffer) {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Text(text) if self.echo => {
                let _ = self.protocol.send_text(&text);
            }
            Message::Binary(data) if self.echo => {
                let _ = self.protocol.send(OpCode::Binary, &data);
            }
            Message::Text(text) => {
                if let Some(reply) = rpc::handle_text(
                    &self.context,
                    &self.rpc,
                    Some(self.remote),
                    self.principal.as_ref(),
                    &text,
                ) {
                    if let Err(e) = self.protocol.send_text(&reply) {
                        tracing::debug!(connection_id = %self.id, error = %e, "Dropped RPC reply");
                    }
                }
            }
            Message::Binary(data) => {
                tracing::debug!(connection_id = %self.id, len = data.len(), "Ignoring binary message");
            }
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        if !self.protocol.has_outbound() {
            return Ok(());
        }
        for frame in self.protocol.take_outbound() {
            self.stream.write_all(&frame).await?;
        }
        self.stream.flush().await
    }
}

/// Start the engine for a connection the HTTP server just upgraded.
///
/// `principal` is whoever authenticated the upgrade; RPC calls on the
/// connection run as them.
pub fn spawn_server(
    context: Arc<ServerContext>,
    stream: TcpStream,
    remote: SocketAddr,
    leftover: Vec<u8>,
    echo: bool,
    principal: Option<Principal>,
    guard: ConnectionGuard,
) -> WebSocketHandle {
    let (engine, handle) =
        WebSocketEngine::new(context, stream, remote, leftover, Role::Server, echo, principal, guard);
    tokio::spawn(engine.run());
    handle
}

/// Open a client connection to a peer and start its engine.
pub async fn connect(context: Arc<ServerContext>, addr: SocketAddr, path: &str) -> Result<WebSocketHandle, HandshakeError> {
    let config = context.config();
    let limit = Duration::from_secs(config.websocket.handshake_timeout_secs);

    let mut stream = tokio::time::timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| HandshakeError::Io("connect timed out".into()))?
        .map_err(|e| HandshakeError::Io(e.to_string()))?;

    let key = handshake::generate_key();
    let mut extra = vec![
        (PEER_UUID_HEADER, context.identity().uuid.clone()),
        (PEER_PORT_HEADER, context.port().to_string()),
    ];
    if let Some(auth) = context.auth().basic_header() {
        extra.push(("Authorization", auth));
    }
    let request = handshake::client_request(&addr.ip().to_string(), addr.port(), path, &key, &extra);
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| HandshakeError::Io(e.to_string()))?;

    let mut reader = HttpReader::responses(context.reader_limits());
    let mut buffer = Vec::new();
    let response = read_message(&mut stream, &mut reader, &mut buffer, limit)
        .await
        .map_err(|e| HandshakeError::Io(e.to_string()))?
        .ok_or_else(|| HandshakeError::Io("connection closed during handshake".into()))?;
    handshake::validate_response(&response, &key)?;

    let guard = context.connections().track(ConnectionKind::WebSocket);
    let (engine, handle) = WebSocketEngine::new(Arc::clone(&context), stream, addr, buffer, Role::Client, false, None, guard);
    tokio::spawn(engine.run());
    Ok(handle)
}
