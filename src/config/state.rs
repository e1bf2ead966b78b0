//! Small persisted runtime state that survives restarts.
//!
//! Currently only the last bound listener port, so a restarted instance keeps
//! the address its peers and browsers already know.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PersistedState {
    /// Port the listener was last bound to.
    pub port: Option<u16>,
    /// Configured port at the time `port` was recorded.
    pub configured_port: Option<u16>,
}

impl PersistedState {
    /// The port to try first: the remembered one, unless the configured
    /// port has changed since it was recorded.
    pub fn preferred_port(&self, configured: u16) -> u16 {
        match (self.port, self.configured_port) {
            (Some(port), Some(recorded)) if recorded == configured => port,
            _ => configured,
        }
    }
}

/// Reads and writes [`PersistedState`] as TOML.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: Option<PathBuf>,
}

impl StateStore {
    /// A store backed by `path`, or a no-op store when `None`.
    pub fn new(path: Option<&str>) -> Self {
        Self {
            path: path.map(PathBuf::from),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the state; a missing or unreadable file yields the default.
    pub fn load(&self) -> PersistedState {
        let Some(path) = &self.path else {
            return PersistedState::default();
        };
        match fs::read_to_string(path) {
            Ok(s) => toml::from_str(&s).unwrap_or_else(|e| {
                tracing::warn!(path = ?path, error = %e, "Ignoring unreadable state file");
                PersistedState::default()
            }),
            Err(_) => PersistedState::default(),
        }
    }

    pub fn save(&self, state: &PersistedState) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = toml::to_string(state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)
    }
}
