//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the server context and register the built-in services
//! - Start discovery and the peer directory when peers are enabled
//! - Bind the listener, then hand back a runnable instance
//!
//! # Design Decisions
//! - Binding failures are fatal; discovery failures are not
//! - Discovery is pluggable so tests and embedders can feed events directly
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::NetplaneConfig;
use crate::context::ServerContext;
use crate::http::HttpServer;
use crate::net::{Listener, ListenerError};
use crate::peers::{self, DiscoveryEvent, MulticastDiscovery};
use crate::services;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Listener failed: {0}")]
    Listener(#[from] ListenerError),
}

/// Where the peer directory gets its discovery events.
pub enum DiscoverySource {
    /// UDP multicast on the LAN.
    Multicast,
    /// Events supplied by the caller.
    Channel(mpsc::UnboundedReceiver<DiscoveryEvent>),
}

/// A bound, not yet running, instance.
pub struct Instance {
    server: HttpServer,
    listener: Listener,
}

impl Instance {
    pub async fn start(config: NetplaneConfig, discovery: DiscoverySource) -> Result<Self, StartupError> {
        let context = ServerContext::new(config);
        services::register_builtin(&context);

        if context.config().peers.enabled {
            start_peers(&context, discovery).await;
        } else {
            tracing::info!("Peer subsystem disabled");
        }

        let server = HttpServer::new(Arc::clone(&context));
        let listener = server.bind().await?;
        Ok(Self { server, listener })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        self.server.context()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        self.listener.local_addr().map_err(ListenerError::Bind)
    }

    /// Serve until the context's shutdown fires.
    pub async fn run(self) -> Result<(), ListenerError> {
        self.server.run(self.listener).await
    }
}

async fn start_peers(context: &Arc<ServerContext>, discovery: DiscoverySource) {
    let events = match discovery {
        DiscoverySource::Channel(rx) => rx,
        DiscoverySource::Multicast => {
            let (tx, rx) = mpsc::unbounded_channel();
            match MulticastDiscovery::start(
                &context.config().peers,
                context.identity().uuid.clone(),
                tx,
                context.shutdown(),
            )
            .await
            {
                Ok(discovery) => {
                    context.attach_advertiser(discovery);
                }
                Err(e) => tracing::warn!(
                    error = %e,
                    port = context.config().peers.discovery_port,
                    "LAN discovery unavailable; only incoming peer links will be tracked"
                ),
            }
            rx
        }
    };
    context.attach_peers(peers::spawn(Arc::clone(context), events));
}
