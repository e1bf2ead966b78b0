//! Built-in handlers every instance serves.
//!
//! # Data Flow
//! ```text
//! HandlerRegistry
//!     ├── /                  RootPage
//!     ├── /services/         ServicesIndex (recursive)
//!     ├── /services/network/ identity and peer list
//!     └── /services/auth/    WebSocket access tokens
//! ```
//!
//! # Design Decisions
//! - The index is recursive, so unknown service paths get a useful 404 instead of the root page
//! - Registration never replaces an existing handler; embedding code may mount its own first

pub mod auth;
pub mod index;
pub mod network;

use std::sync::Arc;

use crate::context::ServerContext;

pub use index::{RootPage, ServicesIndex};

/// Register the built-in handlers on `context`.
pub fn register_builtin(context: &ServerContext) {
    let handlers: Vec<Arc<dyn crate::routing::Handler>> = vec![
        Arc::new(RootPage::new()),
        Arc::new(ServicesIndex::new()),
        Arc::new(network::service()),
        Arc::new(auth::service()),
    ];
    for handler in handlers {
        let signature = handler.meta().signature().to_string();
        if !context.register(handler) {
            tracing::warn!(signature = %signature, "Built-in handler already registered");
        }
    }
}
