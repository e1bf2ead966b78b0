//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Context → Built-in services → Discovery + peer directory → Bind
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Withdraw advertisement → Stop accepting
//!         → WebSockets close 1001 → Drain connections → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Draining is bounded; stragglers are logged, not awaited

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::spawn_signal_handler;
pub use startup::{DiscoverySource, Instance, StartupError};
