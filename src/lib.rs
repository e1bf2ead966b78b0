//! netplane: an embeddable network control plane.
//!
//! HTTP/1.1 server with a handler registry and typed service methods,
//! RFC 6455 WebSockets on the same port, JSON-RPC over those sockets, and a
//! peer directory that finds other instances and links to them.

pub mod config;
pub mod context;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod peers;
pub mod routing;
pub mod rpc;
pub mod services;
pub mod websocket;

pub use config::NetplaneConfig;
pub use context::ServerContext;
pub use http::HttpServer;
pub use lifecycle::{DiscoverySource, Instance, Shutdown};
