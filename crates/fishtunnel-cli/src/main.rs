//! fishtunnel
//!
//! Connects to a `fishtunnel-daemon` and relays the console to the remote
//! engine: stdin lines go out, engine output comes back on stdout.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fishtunnel_cli::ClientConfig;
use fishtunnel_cli::connector;
use fishtunnel_core::tracing_init::{crate_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "fishtunnel")]
#[command(version, about = "Drive a remote UCI engine from the local console")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "FISHTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Daemon host (overrides `server.host`)
    #[arg(long, env = "FISHTUNNEL_HOST")]
    host: Option<String>,

    /// Daemon port (overrides `server.port`)
    #[arg(short, long, env = "FISHTUNNEL_PORT")]
    port: Option<u16>,

    /// Seconds to wait for the connection (overrides `server.connect_timeout_secs`)
    #[arg(long, env = "FISHTUNNEL_CONNECT_TIMEOUT")]
    connect_timeout: Option<u64>,

    /// Seconds of idle time between keepalive probes (overrides `relay.keepalive_interval_secs`)
    #[arg(long, env = "FISHTUNNEL_KEEPALIVE")]
    keepalive: Option<u64>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "FISHTUNNEL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "FISHTUNNEL_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(secs) = self.connect_timeout {
            config.server.connect_timeout_secs = secs;
        }
        if let Some(secs) = self.keepalive {
            config.relay.keepalive_interval_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(
        &crate_filter(&["fishtunnel", "fishtunnel_cli", "fishtunnel_core"], &args.log_level),
        args.log_json,
    );

    let mut config = ClientConfig::resolve(args.config.as_deref())?;
    args.apply(&mut config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server.address(),
        "Starting fishtunnel"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C shutdown signal");
                shutdown.cancel();
            }
        }
    });

    let report = connector::run(
        &config,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown,
    )
    .await?;

    let code = i32::from(report.has_failures());
    if code != 0 {
        warn!(cause = %report.cause, "session ended with errors");
    }
    // The stdin reader may still be parked in a blocking read that the
    // runtime would wait on during shutdown.
    std::process::exit(code);
}
