//! Client configuration.
//!
//! Resolved in three layers, lowest priority first:
//! 1. Built-in defaults
//! 2. TOML config file (`-c/--config`, or `~/.config/fishtunnel/client.toml`)
//! 3. CLI flags / `FISHTUNNEL_*` environment variables
//!
//! ```toml
//! [server]
//! host = "engine.example.org"
//! port = 9999
//!
//! [relay]
//! keepalive_interval_secs = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fishtunnel_core::RelayConfig;

use crate::error::ConfigError;

/// Complete connector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Where the daemon lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            connect_timeout_secs: 10,
        }
    }
}

impl ServerSection {
    /// `host:port`, bracketing bare IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ClientConfig {
    /// Default config file: `<config dir>/fishtunnel/client.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("fishtunnel").join("client.toml"))
    }

    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `explicit` if given (it must exist), otherwise the default file
    /// if present, otherwise built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.is_empty() {
            return Err(ConfigError::Invalid("server.host must not be empty".into()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must not be 0".into()));
        }
        if self.server.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.connect_timeout_secs must be positive".into(),
            ));
        }
        self.relay
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
