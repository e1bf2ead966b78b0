//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use crate::config::schema::NetplaneConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<NetplaneConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    Ok(config)
}

/// Parse and validate configuration text, applying environment overrides.
pub fn parse_config(content: &str) -> Result<NetplaneConfig, ConfigError> {
    let mut config: NetplaneConfig = toml::from_str(content)?;
    apply_env_overrides(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Overrides: NETPLANE_PORT, NETPLANE_PRIORITY, NETPLANE_NAME.
pub fn apply_env_overrides(config: &mut NetplaneConfig) {
    if let Ok(s) = std::env::var("NETPLANE_PORT") {
        match s.parse::<u16>() {
            Ok(p) => config.server.port = p,
            Err(_) => tracing::warn!(value = %s, "Ignoring invalid NETPLANE_PORT"),
        }
    }
    if let Ok(s) = std::env::var("NETPLANE_PRIORITY") {
        match s.parse::<i64>() {
            Ok(p) => config.peers.priority = p,
            Err(_) => tracing::warn!(value = %s, "Ignoring invalid NETPLANE_PRIORITY"),
        }
    }
    if let Ok(s) = std::env::var("NETPLANE_NAME") {
        if !s.is_empty() {
            config.peers.name = s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_values_surface_as_validation_error() {
        let err = parse_config("[server]\nmax_workers = 0\n").unwrap_err();
        match err {
            ConfigError::Validation(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "server.max_workers");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn syntax_error_is_parse_error() {
        assert!(matches!(
            parse_config("[server\nport = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
