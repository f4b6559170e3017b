//! Connector session: the console on one side, the daemon on the other.
//!
//! Three execution units share one connection: `stream->conn` relays console
//! lines out, `conn->stream` relays engine output to the console, and the
//! keepalive emitter probes an idle connection. The first unit to stop ends
//! the session.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fishtunnel_core::relay::{connection_to_stream, stream_to_connection};
use fishtunnel_core::{
    Passthrough, RelayConfig, SerializedWriter, SessionReport, Supervisor, UnitKind,
    keepalive::emit_keepalive,
};

use crate::config::{ClientConfig, ServerSection};
use crate::error::ConnectorError;

/// Open the outbound connection, bounded by the configured timeout.
pub async fn connect(server: &ServerSection) -> Result<TcpStream, ConnectorError> {
    let addr = server.address();
    let timeout = server.connect_timeout();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ConnectorError::ConnectTimeout {
            addr: addr.clone(),
            timeout,
        })?
        .map_err(|source| ConnectorError::Connect {
            addr: addr.clone(),
            source,
        })?;
    // Lines are small and latency-sensitive.
    stream
        .set_nodelay(true)
        .map_err(|source| ConnectorError::Connect { addr, source })?;
    Ok(stream)
}

/// Validate `config`, connect to the daemon and relay until the session
/// ends.
pub async fn run<R, W>(
    config: &ClientConfig,
    console_in: R,
    console_out: W,
    shutdown: CancellationToken,
) -> Result<SessionReport, ConnectorError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    config.validate()?;
    let stream = connect(&config.server).await?;
    let peer = stream
        .peer_addr()
        .map_or_else(|_| config.server.address(), |addr| addr.to_string());
    info!(%peer, "connected");
    Ok(run_session(
        stream,
        &peer,
        console_in,
        console_out,
        &config.relay,
        shutdown.child_token(),
    )
    .await)
}

/// Relay between an established connection and the console.
///
/// `cancel` is this session's stop flag. The connection is shut down before
/// returning, whatever ended the session.
pub async fn run_session<C, R, W>(
    conn: C,
    peer: &str,
    console_in: R,
    console_out: W,
    relay: &RelayConfig,
    cancel: CancellationToken,
) -> SessionReport
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (conn_read, conn_write) = tokio::io::split(conn);
    let writer = SerializedWriter::new(conn_write);

    let mut supervisor = Supervisor::new(peer, cancel, relay.drain_grace());
    let token = supervisor.token();
    supervisor.spawn(
        UnitKind::StreamToConnection,
        stream_to_connection(console_in, writer.clone(), Arc::new(Passthrough), token.clone()),
    );
    supervisor.spawn(
        UnitKind::ConnectionToStream,
        connection_to_stream(conn_read, console_out, relay.clone(), token.clone()),
    );
    supervisor.spawn(
        UnitKind::Keepalive,
        emit_keepalive(
            writer.clone(),
            relay.probe(),
            relay.keepalive_interval(),
            token,
        ),
    );

    let cause = supervisor
        .wait_first(std::future::pending())
        .await;
    info!(%peer, %cause, "closing connection");
    supervisor.drain().await;

    match tokio::time::timeout(relay.drain_grace(), writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%peer, error = %e, "connection shutdown failed"),
        Err(_) => debug!(%peer, "connection shutdown timed out"),
    }
    drop(writer);

    supervisor.finish(cause)
}
