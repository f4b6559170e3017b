//! Listener configuration.

use std::net::SocketAddr;
use std::sync::Arc;

use fishtunnel_core::{LineRewrite, Passthrough, RelayConfig};

use crate::engine::EngineCommand;

/// What to do when accepting a connection fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum AcceptErrorPolicy {
    /// Stop accepting and exit once live connections end.
    #[default]
    FailFast,
    /// Log the failure and keep accepting.
    Continue,
}

/// Immutable configuration shared by the acceptor and every handler.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to listen on.
    pub addr: SocketAddr,
    /// Engine to spawn for each connection.
    pub engine: EngineCommand,
    /// Applied to every engine output line before it is sent.
    pub rewrite: Arc<dyn LineRewrite>,
    pub accept_errors: AcceptErrorPolicy,
    pub relay: RelayConfig,
}

impl ListenerConfig {
    pub fn new(addr: SocketAddr, engine: EngineCommand) -> Self {
        Self {
            addr,
            engine,
            rewrite: Arc::new(Passthrough),
            accept_errors: AcceptErrorPolicy::default(),
            relay: RelayConfig::default(),
        }
    }

    #[must_use]
    pub fn with_rewrite(mut self, rewrite: impl LineRewrite + 'static) -> Self {
        self.rewrite = Arc::new(rewrite);
        self
    }

    #[must_use]
    pub const fn with_accept_errors(mut self, policy: AcceptErrorPolicy) -> Self {
        self.accept_errors = policy;
        self
    }

    #[must_use]
    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }
}
