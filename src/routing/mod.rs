//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (path, verb, query)
//!     → dispatcher.rs (auth, upgrade detection)
//!     → registry.rs (exact signature, else longest recursive prefix)
//!     → handler.rs (Handler::process)
//!         → service.rs (method table: verbs, binding, help, serialisation)
//!     → Return: response on the request, or NotFound
//!
//! JSON-RPC:
//!     "/services/network/GetUuid" → registry (exact) → service.call_rpc
//! ```
//!
//! # Design Decisions
//! - Handlers register at runtime; lookups clone an Arc and release the lock
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same handler

pub mod dispatcher;
pub mod handler;
pub mod registry;
pub mod service;

pub use dispatcher::{dispatch, dispatch_rpc, Dispatch};
pub use handler::{normalize_signature, CallContext, Handler, HandlerMeta};
pub use registry::HandlerRegistry;
pub use service::{Arguments, MethodSpec, ParamType, Service, ServiceError};
