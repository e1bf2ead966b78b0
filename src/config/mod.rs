//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse, deserialize, env overrides)
//!     → validation.rs (semantic checks)
//!     → NetplaneConfig (validated, immutable)
//!     → shared via Arc<ServerContext> to all subsystems
//!
//! Runtime state (state.rs):
//!     last bound port → state file → preferred port on next start
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod state;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AuthConfig, NetplaneConfig, ObservabilityConfig, PeerConfig, RpcConfig, ServerConfig,
    WebSocketConfig,
};
pub use state::{PersistedState, StateStore};
