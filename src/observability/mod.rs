//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer, EnvFilter)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Connection IDs flow through log fields, not span stacks
//! - Metrics are cheap (atomic increments) and no-ops without an exporter
//! - The exporter is opt-in

pub mod logging;
pub mod metrics;
