//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, worker pool capacity)
//!     → connection.rs (identity, lifecycle tracking)
//!     → Hand off to HTTP layer (one worker per connection)
//!     → optionally transferred to a WebSocket task
//!
//! Connection States:
//!     Accepting → Http → (WebSocket) → Closed
//! ```
//!
//! # Design Decisions
//! - The worker permit is acquired before accept, so excess clients queue
//! - Each connection tracked for graceful shutdown
//! - An upgraded connection keeps its ID but gives its worker slot back

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionKind, ConnectionTracker};
pub use listener::{Listener, ListenerError, WorkerPermit};
