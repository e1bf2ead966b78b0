//! JSON-RPC subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound (per connection):
//!     caller → correlator.rs (id, pending map, timeout)
//!         → envelope.rs (request/notification) → WebSocket text frame
//!     reply frame → inbound.rs → correlator.rs → request.rs → parent notified
//!
//! Inbound:
//!     text frame → inbound.rs (parse, batch, classify)
//!         → routing::dispatcher (service method) → result/error envelope
//! ```
//!
//! # Design Decisions
//! - One correlator per WebSocket connection; ids are connection-scoped
//! - Notifications carry no id, are never tracked and never answered
//! - Batches are answered with one array holding only the non-notification replies

pub mod correlator;
pub mod envelope;
pub mod inbound;
pub mod request;

pub use correlator::RpcCorrelator;
pub use envelope::RpcError;
pub use inbound::handle_text;
pub use request::{RequestState, RpcCaller, RpcRequest};
