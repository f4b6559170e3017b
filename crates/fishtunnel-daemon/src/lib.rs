//! fishtunnel Daemon Library
//!
//! The listener role:
//! - Engine executable validation and per-connection process spawning
//! - Connection acceptor with a configurable accept-error policy
//! - Per-connection handler relaying the socket to the engine's stdio

pub mod config;
pub mod engine;
pub mod error;
pub mod listener;

pub use config::{AcceptErrorPolicy, ListenerConfig};
pub use engine::{Engine, EngineCommand, StderrMode};
pub use error::{EngineError, ListenerError};
pub use listener::{ConnectionReport, Listener, handle_connection};
