//! Relay tuning shared by the connector and the listener.
//!
//! Both roles inject these values into every handler at construction; a
//! running handler never sees them change. The connector reads them from the
//! `[relay]` section of its TOML config, the listener from CLI flags.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::keepalive::KeepaliveProbe;

/// Default keepalive probe token.
pub const DEFAULT_PROBE: &str = "keepalive\n";

/// Immutable relay parameters for one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upper bound on a single read from the connection.
    pub buffer_size: usize,
    /// How long a connection read may wait before the loop re-checks its
    /// stop flag (milliseconds).
    pub read_timeout_ms: u64,
    /// Idle period after which the connector sends a probe (seconds).
    pub keepalive_interval_secs: u64,
    /// Time units get to observe the stop flag before being aborted
    /// (milliseconds).
    pub drain_grace_ms: u64,
    /// Probe token; both ends must agree on it.
    pub probe: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            read_timeout_ms: 500,
            keepalive_interval_secs: 10,
            drain_grace_ms: 100,
            probe: DEFAULT_PROBE.to_string(),
        }
    }
}

impl RelayConfig {
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn probe(&self) -> KeepaliveProbe {
        KeepaliveProbe::new(self.probe.as_bytes())
    }

    /// Reject values that would make a relay loop spin or never match a probe.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(RelayError::Config("buffer_size must be positive".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(RelayError::Config("read_timeout_ms must be positive".into()));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(RelayError::Config(
                "keepalive_interval_secs must be positive".into(),
            ));
        }
        if self.drain_grace_ms == 0 {
            return Err(RelayError::Config("drain_grace_ms must be positive".into()));
        }
        if self.probe.is_empty() {
            return Err(RelayError::Config("probe must not be empty".into()));
        }
        // A probe larger than one read can never arrive as a single chunk.
        if self.probe.len() > self.buffer_size {
            return Err(RelayError::Config(format!(
                "probe ({} bytes) does not fit in buffer_size ({})",
                self.probe.len(),
                self.buffer_size
            )));
        }
        Ok(())
    }
}
