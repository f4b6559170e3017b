//! fishtunnel Core Library
//!
//! Relay engine shared by the connector (`fishtunnel`) and the listener
//! (`fishtunnel-daemon`):
//! - Serialized writes from several producers onto one connection
//! - Duplex relay between a connection and a local stream
//! - Keepalive probe emission and filtering
//! - First-failure shutdown coordination for a handler instance

pub mod config;
pub mod error;
pub mod keepalive;
pub mod relay;
pub mod rewrite;
pub mod supervisor;
pub mod tracing_init;
pub mod writer;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use keepalive::{KeepaliveProbe, ProbeFilter};
pub use relay::{UnitExit, UnitKind, UnitResult};
pub use rewrite::{LineRewrite, Passthrough, VersionMask};
pub use supervisor::{SessionReport, SessionState, Supervisor, TerminationCause};
pub use writer::SerializedWriter;
