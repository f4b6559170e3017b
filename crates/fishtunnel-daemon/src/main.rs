//! fishtunnel Daemon
//!
//! Listens for connections and serves each one with its own engine process,
//! relaying the socket to the engine's stdin and stdout.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fishtunnel_core::RelayConfig;
use fishtunnel_core::rewrite::{DEFAULT_ENGINE_NAME, DEFAULT_MARKER, VersionMask};
use fishtunnel_core::tracing_init::{crate_filter, init_tracing};
use fishtunnel_daemon::{AcceptErrorPolicy, EngineCommand, Listener, ListenerConfig, StderrMode};

#[derive(Parser, Debug)]
#[command(name = "fishtunnel-daemon")]
#[command(version, about = "fishtunnel daemon - one UCI engine per connection")]
struct Args {
    /// Listen on this address
    #[arg(short, long, default_value = "0.0.0.0", env = "FISHTUNNEL_ADDR")]
    addr: IpAddr,

    /// Listen on this port
    #[arg(short, long, default_value_t = 9999, env = "FISHTUNNEL_PORT")]
    port: u16,

    /// Engine executable
    #[arg(short = 's', long, visible_alias = "stockfish", env = "FISHTUNNEL_ENGINE")]
    engine: PathBuf,

    /// Extra argument passed to the engine (repeatable)
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// What to do with the engine's stderr (never relayed)
    #[arg(long, value_enum, default_value_t = StderrMode::Discard, env = "FISHTUNNEL_ENGINE_STDERR")]
    engine_stderr: StderrMode,

    /// Engine name whose version is masked in banner lines
    #[arg(long, default_value = DEFAULT_ENGINE_NAME, env = "FISHTUNNEL_BANNER_NAME")]
    banner_name: String,

    /// Replacement for the masked version
    #[arg(long, default_value = DEFAULT_MARKER, env = "FISHTUNNEL_BANNER_MARKER")]
    banner_marker: String,

    /// Relay banner lines unchanged
    #[arg(long, env = "FISHTUNNEL_NO_MASK")]
    no_mask: bool,

    /// Accept failures either stop the daemon or are logged and skipped
    #[arg(long, value_enum, default_value_t = AcceptErrorPolicy::FailFast, env = "FISHTUNNEL_ACCEPT_ERRORS")]
    accept_errors: AcceptErrorPolicy,

    /// Upper bound on one read from a connection
    #[arg(long, default_value_t = 4096, env = "FISHTUNNEL_BUFFER_SIZE")]
    buffer_size: usize,

    /// Milliseconds a connection read waits before re-checking for shutdown
    #[arg(long, default_value_t = 500, env = "FISHTUNNEL_READ_TIMEOUT_MS")]
    read_timeout_ms: u64,

    /// Milliseconds relay units get to stop before being aborted
    #[arg(long, default_value_t = 100, env = "FISHTUNNEL_DRAIN_GRACE_MS")]
    drain_grace_ms: u64,

    /// Keepalive probe line sent by connectors (without the newline)
    #[arg(long, default_value = "keepalive", env = "FISHTUNNEL_PROBE_LINE")]
    probe_line: String,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "FISHTUNNEL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "FISHTUNNEL_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(
        &crate_filter(&["fishtunnel_daemon", "fishtunnel_core"], &args.log_level),
        args.log_json,
    );

    let engine = EngineCommand::new(&args.engine)
        .with_args(args.engine_args.iter().cloned())
        .with_stderr(args.engine_stderr);
    debug!(engine = %engine.program().display(), "Using engine");

    let relay = RelayConfig {
        buffer_size: args.buffer_size,
        read_timeout_ms: args.read_timeout_ms,
        drain_grace_ms: args.drain_grace_ms,
        probe: format!("{}\n", args.probe_line),
        ..Default::default()
    };
    relay.validate()?;

    let mut config = ListenerConfig::new(SocketAddr::new(args.addr, args.port), engine)
        .with_relay(relay)
        .with_accept_errors(args.accept_errors);
    if !args.no_mask {
        config = config.with_rewrite(VersionMask::new(&args.banner_name, &args.banner_marker)?);
    }

    let listener = Listener::bind(config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %listener.local_addr()?,
        "Started server"
    );

    // Notify systemd that the daemon is ready to serve (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    listener.serve(shutdown).await?;
    info!("Daemon stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
            _ = sigterm_future => info!("Received SIGTERM shutdown signal"),
        }
        shutdown.cancel();
    });
    Ok(())
}
