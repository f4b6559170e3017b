//! Connector error types.

use std::path::PathBuf;
use std::time::Duration;

/// Errors loading or validating the client configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors establishing the outbound connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
