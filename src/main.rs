//! netplane (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌───────────────────────────────────────────────────────┐
//!                 │                       NETPLANE                        │
//!                 │                                                       │
//!   HTTP client   │  ┌──────────┐   ┌──────────┐   ┌────────────────────┐ │
//!   ──────────────┼─▶│ listener │──▶│  reader  │──▶│ dispatcher         │ │
//!                 │  │ + permits│   │          │   │ auth → registry    │ │
//!                 │  └──────────┘   └──────────┘   └─────────┬──────────┘ │
//!                 │                                   upgrade│            │
//!                 │                                          ▼            │
//!   WebSocket     │                              ┌────────────────────┐   │
//!   ◀────────────▶┼──────────────────────────────│ websocket engine   │   │
//!                 │                              │ + rpc correlator   │   │
//!                 │                              └─────────▲──────────┘   │
//!                 │                                        │              │
//!   LAN beacons   │  ┌──────────┐   ┌──────────────────────┴───────────┐  │
//!   ◀────────────▶┼─▶│discovery │──▶│ peer directory (election, retry) │  │
//!                 │  └──────────┘   └──────────────────────────────────┘  │
//!                 └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use netplane::config::{self, NetplaneConfig};
use netplane::lifecycle::{spawn_signal_handler, DiscoverySource, Instance};
use netplane::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "netplane")]
#[command(about = "Network control plane: HTTP services, WebSockets and peer links", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listener port (overrides the file and NETPLANE_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Election priority
    #[arg(long, allow_negative_numbers = true)]
    priority: Option<i64>,

    /// Name advertised to peers
    #[arg(long)]
    name: Option<String>,

    /// Disable discovery and peer links
    #[arg(long)]
    no_peers: bool,
}

fn load(cli: &Cli) -> Result<NetplaneConfig, config::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => config::parse_config("")?,
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(priority) = cli.priority {
        config.peers.priority = priority;
    }
    if let Some(name) = &cli.name {
        config.peers.name = name.clone();
    }
    if cli.no_peers {
        config.peers.enabled = false;
    }
    config::validation::validate_config(&config).map_err(config::ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load(&cli)?;

    logging::init(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "netplane starting");
    tracing::info!(
        bind_host = %config.server.bind_host,
        port = config.server.port,
        max_workers = config.server.max_workers,
        auth = config.auth.enabled,
        peers = config.peers.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let instance = Instance::start(config, DiscoverySource::Multicast).await?;
    tracing::info!(
        address = %instance.local_addr()?,
        uuid = %instance.context().identity().uuid,
        "Listening for connections"
    );
    spawn_signal_handler(Arc::clone(instance.context().shutdown()));

    instance.run().await?;
    tracing::info!("netplane stopped");
    Ok(())
}
