//! Shared tracing/logging initialization.
//!
//! Both binaries set up `tracing_subscriber` with an env-filter and optional
//! JSON output. Logs always go to stderr: on the connector, stdout is the
//! protocol channel.

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Build a filter directive giving every listed crate the same level,
/// e.g. `"fishtunnel_cli=info,fishtunnel_core=info"`.
pub fn crate_filter(crates: &[&str], level: &str) -> String {
    crates
        .iter()
        .map(|name| format!("{name}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber: `RUST_LOG` if set, else `default_filter`,
/// written to stderr as text or JSON lines.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let stderr = fmt::layer().with_writer(std::io::stderr);
    let output = if log_json {
        stderr.json().boxed()
    } else {
        stderr.boxed()
    };
    tracing_subscriber::registry().with(filter).with(output).init();
}
