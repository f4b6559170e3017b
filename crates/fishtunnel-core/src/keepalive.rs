//! Keepalive probes.
//!
//! The connector writes the probe token at a fixed interval so a silently
//! broken connection surfaces as a write error even while the console is
//! idle. The receiving `conn->stream` direction recognises the token and
//! drops it before anything reaches the local stream.

use std::borrow::Cow;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::RelayError;
use crate::relay::{UnitExit, UnitResult};
use crate::writer::SerializedWriter;

/// Fixed byte sequence carrying no payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveProbe {
    token: Vec<u8>,
}

impl KeepaliveProbe {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.token
    }

    /// Whether `chunk` is exactly one probe.
    pub fn matches(&self, chunk: &[u8]) -> bool {
        chunk == self.token.as_slice()
    }
}

/// Drops probes from one connection's received byte stream.
///
/// A chunk that is exactly the probe is dropped. When the token is a whole
/// line, copies of it that TCP coalesced with payload are removed too, but
/// only where they start a line: the filter remembers whether the previous
/// chunk ended on a newline, so a payload line split across reads is never
/// cut. A probe split across two reads passes through.
#[derive(Debug, Clone)]
pub struct ProbeFilter {
    probe: KeepaliveProbe,
    at_line_start: bool,
}

impl ProbeFilter {
    pub const fn new(probe: KeepaliveProbe) -> Self {
        Self {
            probe,
            at_line_start: true,
        }
    }

    /// Remove probes from the next received chunk; every other byte is kept
    /// in order.
    pub fn filter<'a>(&mut self, chunk: &'a [u8]) -> Cow<'a, [u8]> {
        let stripped = if self.probe.token.ends_with(b"\n") {
            self.strip_probe_lines(chunk)
        } else if self.probe.matches(chunk) {
            Cow::Borrowed(&chunk[..0])
        } else {
            Cow::Borrowed(chunk)
        };
        // Removed probes are whole lines, so the raw chunk and the kept
        // bytes end in the same line state.
        if let Some(last) = chunk.last() {
            self.at_line_start = *last == b'\n';
        }
        stripped
    }

    fn strip_probe_lines<'a>(&self, chunk: &'a [u8]) -> Cow<'a, [u8]> {
        let token = self.probe.as_bytes();
        let is_probe = |index: usize, line: &[u8]| {
            (index > 0 || self.at_line_start) && line == token
        };

        let lines = chunk.split_inclusive(|b| *b == b'\n').enumerate();
        if !lines.clone().any(|(index, line)| is_probe(index, line)) {
            return Cow::Borrowed(chunk);
        }
        Cow::Owned(
            lines
                .filter(|(index, line)| !is_probe(*index, *line))
                .flat_map(|(_, line)| line.iter().copied())
                .collect(),
        )
    }
}

/// Write `probe` through `writer` every `interval` until cancelled.
///
/// A failed write ends the unit with [`RelayError::ConnectionWrite`].
pub async fn emit_keepalive<W>(
    writer: SerializedWriter<W>,
    probe: KeepaliveProbe,
    interval: Duration,
    cancel: CancellationToken,
) -> UnitResult
where
    W: AsyncWrite + Unpin,
{
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await; // Skip first immediate tick

    loop {
        if cancel.is_cancelled() {
            return Ok(UnitExit::Cancelled);
        }
        tokio::select! {
            () = cancel.cancelled() => return Ok(UnitExit::Cancelled),
            _ = timer.tick() => {
                writer
                    .write(probe.as_bytes())
                    .await
                    .map_err(RelayError::ConnectionWrite)?;
                trace!("keepalive probe sent");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::time::Instant;

    fn probe() -> KeepaliveProbe {
        KeepaliveProbe::new("keepalive\n")
    }

    fn filter() -> ProbeFilter {
        ProbeFilter::new(probe())
    }

    #[test]
    fn exact_chunk_is_dropped() {
        assert!(probe().matches(b"keepalive\n"));
        assert!(filter().filter(b"keepalive\n").is_empty());
    }

    #[test]
    fn payload_is_untouched() {
        let chunk = b"go depth 10\n";
        assert!(!probe().matches(chunk));
        assert!(matches!(filter().filter(chunk), Cow::Borrowed(c) if c == chunk));
    }

    #[test]
    fn coalesced_probe_lines_are_removed() {
        let stripped = filter().filter(b"keepalive\nposition startpos\nkeepalive\ngo\n");
        assert_eq!(stripped.as_ref(), b"position startpos\ngo\n");
    }

    #[test]
    fn probe_text_inside_a_line_is_kept() {
        let chunk = b"setoption name keepalive\n";
        assert_eq!(filter().filter(chunk).as_ref(), chunk);
    }

    #[test]
    fn line_continued_from_previous_chunk_is_kept() {
        let mut filter = filter();
        assert_eq!(filter.filter(b"setoption name ").as_ref(), b"setoption name ");
        assert_eq!(
            filter.filter(b"keepalive\nisready\n").as_ref(),
            b"keepalive\nisready\n"
        );
        // Back on a line boundary, the next probe is dropped again.
        assert!(filter.filter(b"keepalive\n").is_empty());
    }

    #[test]
    fn dropped_keepalive_keeps_line_boundary() {
        let mut filter = filter();
        assert_eq!(filter.filter(b"uci\n").as_ref(), b"uci\n");
        assert!(filter.filter(b"keepalive\n").is_empty());
        assert_eq!(filter.filter(b"keepalive\nisready\n").as_ref(), b"isready\n");
    }

    #[test]
    fn token_without_newline_only_matches_exactly() {
        let mut filter = ProbeFilter::new(KeepaliveProbe::new("\0ping\0"));
        assert!(filter.filter(b"\0ping\0").is_empty());
        assert_eq!(filter.filter(b"uci\n\0ping\0").as_ref(), b"uci\n\0ping\0");
    }

    #[tokio::test(start_paused = true)]
    async fn emits_one_probe_per_interval() {
        let (conn, mut peer) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let task = tokio::spawn(emit_keepalive(
            SerializedWriter::new(conn),
            probe(),
            Duration::from_secs(10),
            cancel.clone(),
        ));

        let mut buf = [0u8; 64];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"keepalive\n");
        assert!(start.elapsed() >= Duration::from_secs(10));

        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"keepalive\n");
        assert!(start.elapsed() >= Duration::from_secs(20));

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Ok(UnitExit::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_ends_the_loop() {
        let (conn, peer) = tokio::io::duplex(64);
        drop(peer);
        let result = emit_keepalive(
            SerializedWriter::new(conn),
            probe(),
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(RelayError::ConnectionWrite(_))));
    }
}
