//! Error types for the relay engine.

use thiserror::Error;

/// Result type alias using [`RelayError`].
pub type Result<T> = std::result::Result<T, RelayError>;

/// Failures that end an execution unit abnormally.
///
/// End-of-stream, peer close and cancellation are not errors; see
/// [`crate::relay::UnitExit`].
#[derive(Debug, Error)]
pub enum RelayError {
    /// Reading from the local stream (console or engine stdout) failed
    #[error("local stream read failed: {0}")]
    LocalRead(#[source] std::io::Error),

    /// Writing to the local stream (console or engine stdin) failed
    #[error("local stream write failed: {0}")]
    LocalWrite(#[source] std::io::Error),

    /// Reading from the network connection failed
    #[error("connection read failed: {0}")]
    ConnectionRead(#[source] std::io::Error),

    /// Writing to the network connection failed
    #[error("connection write failed: {0}")]
    ConnectionWrite(#[source] std::io::Error),

    /// Relay tuning rejected by [`crate::RelayConfig::validate`]
    #[error("invalid relay configuration: {0}")]
    Config(String),
}
