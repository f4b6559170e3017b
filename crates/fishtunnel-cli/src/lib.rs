//! fishtunnel CLI Library
//!
//! The connector role: one outbound connection to a `fishtunnel-daemon`,
//! relayed to and from the local console.

pub mod config;
pub mod connector;
pub mod error;

pub use config::{ClientConfig, ServerSection};
pub use connector::run_session;
pub use error::{ConfigError, ConnectorError};
