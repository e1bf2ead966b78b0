//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (net::Listener)
//!     → server.rs (worker per connection, keep-alive loop)
//!     → reader.rs (incremental parse: start line, headers, body)
//!     → request.rs (verb, path split, query, Accept negotiation)
//!     → routing::dispatcher (auth, upgrade check, handler lookup)
//!     → response.rs (status line, headers, serialised body)
//!     → Send to client, or hand the socket to the WebSocket engine
//! ```
//!
//! # Design Decisions
//! - HTTP/1.0 and 1.1 only, Content-Length bodies only
//! - A malformed request closes the connection without a response
//! - Idle connections are closed after the inactivity timeout

pub mod auth;
pub mod reader;
pub mod request;
pub mod response;
pub mod server;

pub use reader::{HttpReader, RawMessage, ReadError, ReaderLimits, StartLine};
pub use request::{ConnectionMode, ContentType, Headers, QueryParams, Request, StatusCode, Verb, Verbs};
pub use server::HttpServer;
