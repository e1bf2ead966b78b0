//! Peer subsystem.
//!
//! # Data Flow
//! ```text
//! MulticastDiscovery ──DiscoveryEvent──► PeerDirectory task
//!                                            │
//!                     missing identity ──────┼──► IdentityClient (GET details)
//!                                            │
//!                     election: initiate ────┼──► websocket::connect
//!                                            │
//! HttpServer upgrade with peer headers ──────┘ (incoming link)
//! ```
//!
//! # Design Decisions
//! - Election is a pure function of both identities, so both sides agree
//! - Every failure path ends in a single scheduled retry

pub mod directory;
pub mod discovery;
pub mod election;
pub mod identity;

pub use directory::{spawn, PeerDirectoryHandle, PeerSummary, LINK_PATH};
pub use discovery::{Advertiser, DiscoveryEvent, DiscoveryRecord, MulticastDiscovery};
pub use election::{negotiate, Candidate, LinkRole};
pub use identity::{IdentityClient, IdentityError, LocalIdentity, PeerDetails, API_VERSION};
