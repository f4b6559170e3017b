//! Duplex relay between a connection and a local stream.
//!
//! Two one-directional loops, each run as its own execution unit:
//!
//! - [`stream_to_connection`] reads the local stream line by line, applies a
//!   [`LineRewrite`] and writes through the shared [`SerializedWriter`].
//! - [`connection_to_stream`] reads bounded chunks from the connection,
//!   drops keepalive probes and forwards the rest to the local stream,
//!   flushing after every chunk.
//!
//! Neither loop escalates anything itself. It returns a [`UnitResult`] and
//! the supervisor decides what happens next.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::keepalive::ProbeFilter;
use crate::rewrite::LineRewrite;
use crate::writer::SerializedWriter;

/// Identity of an execution unit within a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// Local stream to connection.
    StreamToConnection,
    /// Connection to local stream.
    ConnectionToStream,
    /// Periodic probe writer (connector only).
    Keepalive,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StreamToConnection => "stream->conn",
            Self::ConnectionToStream => "conn->stream",
            Self::Keepalive => "keepalive",
        })
    }
}

/// Normal ways for a unit to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitExit {
    /// Stop flag observed.
    Cancelled,
    /// The local stream reached end-of-file.
    EndOfStream,
    /// The peer closed the connection (zero-length read).
    PeerClosed,
}

/// Outcome of one execution unit.
pub type UnitResult = Result<UnitExit, RelayError>;

/// Relay lines from `local` to the connection until EOF, error or cancel.
pub async fn stream_to_connection<R, W>(
    mut local: R,
    writer: SerializedWriter<W>,
    rewrite: Arc<dyn LineRewrite>,
    cancel: CancellationToken,
) -> UnitResult
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        if cancel.is_cancelled() {
            return Ok(UnitExit::Cancelled);
        }

        line.clear();
        let n = tokio::select! {
            () = cancel.cancelled() => return Ok(UnitExit::Cancelled),
            read = local.read_until(b'\n', &mut line) => read.map_err(RelayError::LocalRead)?,
        };
        if n == 0 {
            return Ok(UnitExit::EndOfStream);
        }

        let outbound = rewrite.rewrite(&line);
        trace!(line = %String::from_utf8_lossy(&outbound).trim_end(), "send");
        writer
            .write(&outbound)
            .await
            .map_err(RelayError::ConnectionWrite)?;
    }
}

/// Relay chunks from the connection to `local` until peer close, error or
/// cancel.
///
/// A read waits at most `config.read_timeout()` before the loop comes back
/// around to check the stop flag.
pub async fn connection_to_stream<R, W>(
    mut conn: R,
    mut local: W,
    config: RelayConfig,
    cancel: CancellationToken,
) -> UnitResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut probes = ProbeFilter::new(config.probe());
    let read_timeout = config.read_timeout();
    let mut buf = vec![0u8; config.buffer_size];
    loop {
        if cancel.is_cancelled() {
            return Ok(UnitExit::Cancelled);
        }

        let n = tokio::select! {
            () = cancel.cancelled() => return Ok(UnitExit::Cancelled),
            read = tokio::time::timeout(read_timeout, conn.read(&mut buf)) => match read {
                Err(_elapsed) => continue,
                Ok(read) => read.map_err(RelayError::ConnectionRead)?,
            },
        };
        if n == 0 {
            return Ok(UnitExit::PeerClosed);
        }

        let chunk = &buf[..n];
        trace!(chunk = %String::from_utf8_lossy(chunk).trim_end(), "recv");
        let payload = probes.filter(chunk);
        if payload.is_empty() {
            trace!("keepalive probe discarded");
            continue;
        }

        local
            .write_all(&payload)
            .await
            .map_err(RelayError::LocalWrite)?;
        local.flush().await.map_err(RelayError::LocalWrite)?;
    }
}
