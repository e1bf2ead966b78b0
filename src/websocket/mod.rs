//! WebSocket subsystem (RFC 6455).
//!
//! # Data Flow
//! ```text
//! HTTP upgrade (server) or connect() (client)
//!     → handshake.rs (validate, Sec-WebSocket-Accept)
//!     → engine.rs (one task per connection, owns the socket)
//!         → protocol.rs (frame decode, validation, close handshake)
//!         → frame.rs (opcodes, close codes, encoding, masking)
//!     → messages: echo, or rpc::handle_text
//!
//! Outbound:
//!     WebSocketHandle → command channel → engine → protocol → socket
//! ```
//!
//! # Design Decisions
//! - The protocol is sans-io so it can be tested byte for byte
//! - Extensions and subprotocols are not negotiated
//! - Peer links and browser clients share one engine

pub mod engine;
pub mod frame;
pub mod handshake;
pub mod protocol;

pub use engine::{connect, spawn_server, Command, WebSocketEngine, WebSocketHandle};
pub use frame::{close_code, OpCode};
pub use handshake::HandshakeError;
pub use protocol::{Message, Role, WebSocketProtocol};
