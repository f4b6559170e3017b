//! Daemon error types.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Errors locating or starting the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine {} not found", path.display())]
    NotFound { path: PathBuf },

    #[error("Failed to spawn engine {}: {source}", path.display())]
    SpawnFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to capture engine {0}")]
    MissingPipe(&'static str),
}

/// Errors that stop the listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
