//! Connection acceptor and per-connection handler.
//!
//! The acceptor runs one handler task per connection, with unbounded
//! concurrency. Handlers share nothing but the immutable [`ListenerConfig`];
//! each owns its connection and its engine process and tears both down
//! when either side goes away.

use std::io;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use fishtunnel_core::relay::{connection_to_stream, stream_to_connection};
use fishtunnel_core::{SerializedWriter, SessionReport, Supervisor, TerminationCause, UnitKind};

use crate::config::{AcceptErrorPolicy, ListenerConfig};
use crate::engine::Engine;
use crate::error::{EngineError, ListenerError};

const LISTEN_BACKLOG: u32 = 5;

/// Bound listening socket plus the configuration handed to every handler.
pub struct Listener {
    listener: TcpListener,
    config: Arc<ListenerConfig>,
}

impl Listener {
    /// Check the engine, then bind with `SO_REUSEADDR` so a restarted daemon
    /// can reclaim its port.
    pub fn bind(config: ListenerConfig) -> Result<Self, ListenerError> {
        config.engine.validate()?;
        let addr = config.addr;
        let bind_err = |source: io::Error| ListenerError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled or, under
    /// [`AcceptErrorPolicy::FailFast`], an accept fails.
    ///
    /// Returns once every handler has finished. Handlers run under child
    /// tokens of `shutdown`, so cancelling it also tears them down.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ListenerError> {
        let tracker = TaskTracker::new();

        let result = loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let config = Arc::clone(&self.config);
                    let cancel = shutdown.child_token();
                    tracker.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, &config, cancel).await {
                            error!(%peer, error = %e, "Failed to start engine");
                        }
                    });
                }
                Err(e) => match self.config.accept_errors {
                    AcceptErrorPolicy::FailFast => {
                        error!(error = %e, "Accept failed, no longer accepting connections");
                        break Err(ListenerError::Accept(e));
                    }
                    AcceptErrorPolicy::Continue => {
                        warn!(error = %e, "Accept failed");
                    }
                },
            }
        };

        tracker.close();
        if !tracker.is_empty() {
            info!(open = tracker.len(), "Waiting for open connections to close");
        }
        tracker.wait().await;
        result
    }
}

/// Outcome of one served connection.
#[derive(Debug)]
pub struct ConnectionReport {
    pub session: SessionReport,
    pub pid: Option<u32>,
    /// Exit status of the engine, reaped during teardown.
    pub engine_status: Option<ExitStatus>,
}

/// Serve one connection: spawn an engine, relay until either side stops,
/// then kill the engine and close the connection.
pub async fn handle_connection<C>(
    conn: C,
    peer: SocketAddr,
    config: &ListenerConfig,
    cancel: CancellationToken,
) -> Result<ConnectionReport, EngineError>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    info!(%peer, "Accepted connection");
    let Engine {
        mut child,
        stdin,
        stdout,
        pid,
    } = config.engine.spawn()?;

    let (conn_read, conn_write) = tokio::io::split(conn);
    let writer = SerializedWriter::new(conn_write);

    let mut supervisor = Supervisor::new(peer.to_string(), cancel, config.relay.drain_grace());
    let token = supervisor.token();
    supervisor.spawn(
        UnitKind::StreamToConnection,
        stream_to_connection(
            BufReader::new(stdout),
            writer.clone(),
            Arc::clone(&config.rewrite),
            token.clone(),
        ),
    );
    supervisor.spawn(
        UnitKind::ConnectionToStream,
        connection_to_stream(conn_read, stdin, config.relay.clone(), token),
    );

    let cause = supervisor
        .wait_first(async { TerminationCause::ProcessExited(child.wait().await.ok()) })
        .await;
    info!(%peer, ?pid, %cause, "Closing connection");
    if matches!(cause, TerminationCause::ProcessExited(_)) {
        // Whatever the engine wrote before exiting is still in the pipe.
        supervisor
            .settle(UnitKind::StreamToConnection, config.relay.drain_grace())
            .await;
    }
    supervisor.drain().await;

    // The engine goes down with the connection, whatever ended the session.
    match child.kill().await {
        Ok(()) => info!(%peer, ?pid, "Killed engine"),
        Err(e) => debug!(%peer, ?pid, error = %e, "Engine already exited"),
    }
    let engine_status = child.try_wait().ok().flatten();

    match tokio::time::timeout(config.relay.drain_grace(), writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%peer, error = %e, "Connection shutdown failed"),
        Err(_) => debug!(%peer, "Connection shutdown timed out"),
    }
    drop(writer);

    let session = supervisor.finish(cause);
    info!(%peer, ?pid, ?engine_status, "Connection closed");
    Ok(ConnectionReport {
        session,
        pid,
        engine_status,
    })
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::{EngineCommand, StderrMode};
    use fishtunnel_core::UnitExit;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

    const ECHO_ENGINE: &str = r#"while IFS= read -r line; do echo "$line"; done"#;

    fn config(script: &str) -> ListenerConfig {
        ListenerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            EngineCommand::new("/bin/sh").with_args(["-c", script]),
        )
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn relays_through_engine() {
        let config = config(ECHO_ENGINE);
        let (conn, client) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let handler = tokio::spawn({
            let cancel = cancel.clone();
            async move { handle_connection(conn, peer(), &config, cancel).await }
        });

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();
        client_write.write_all(b"position startpos\n").await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("position startpos")
        );

        cancel.cancel();
        let report = handler.await.unwrap().unwrap();
        assert_eq!(report.session.cause, TerminationCause::Shutdown);
        assert!(report.pid.is_some());
        assert!(report.engine_status.is_some());
    }

    #[tokio::test]
    async fn client_hangup_kills_engine() {
        let config = config(ECHO_ENGINE);
        let (conn, client) = tokio::io::duplex(1024);
        let handler = tokio::spawn(async move {
            handle_connection(conn, peer(), &config, CancellationToken::new()).await
        });
        drop(client);

        let report = tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        // stdin closes when conn->stream returns, so the engine may exit on
        // its own just as the coordinator notices the unit.
        assert!(matches!(
            report.session.cause,
            TerminationCause::UnitFinished(UnitKind::ConnectionToStream)
                | TerminationCause::ProcessExited(_)
        ));
        assert!(matches!(
            report.session.result_of(UnitKind::ConnectionToStream),
            Some(Ok(UnitExit::PeerClosed))
        ));
        assert!(report.engine_status.is_some());
    }

    /// Run one connection whose client only reads, until the engine exits.
    async fn run_until_engine_exits(config: &ListenerConfig) -> (Vec<u8>, ConnectionReport) {
        let (conn, mut client) = tokio::io::duplex(1024);
        let mut received = Vec::new();
        let (report, read) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                handle_connection(conn, peer(), config, CancellationToken::new()),
                client.read_to_end(&mut received),
            )
        })
        .await
        .unwrap();
        read.unwrap();
        (received, report.unwrap())
    }

    #[tokio::test]
    async fn engine_exit_closes_connection() {
        let config = config("echo bestmove e2e4; sleep 0.2");
        let (received, report) = run_until_engine_exits(&config).await;
        assert_eq!(received, b"bestmove e2e4\n");
        assert!(matches!(
            report.session.cause,
            TerminationCause::ProcessExited(_)
                | TerminationCause::UnitFinished(UnitKind::StreamToConnection)
        ));
        assert!(report.engine_status.unwrap().success());
    }

    #[tokio::test]
    async fn output_written_right_before_exit_is_delivered() {
        // No pause before exiting: the exit is usually seen before stdout EOF.
        let config = config("echo bestmove e2e4");
        for _ in 0..20 {
            let (received, report) = run_until_engine_exits(&config).await;
            assert_eq!(received, b"bestmove e2e4\n", "cause: {}", report.session.cause);
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Install a debug-level subscriber on this (current-thread) runtime.
    fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        (logs, tracing::subscriber::set_default(subscriber))
    }

    const NOISY_ENGINE: &str = "echo 'info string NNUE file missing' >&2; echo uciok";

    #[tokio::test]
    async fn engine_stderr_is_logged_not_relayed() {
        let (logs, _guard) = capture_logs();
        let config = ListenerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            EngineCommand::new("/bin/sh")
                .with_args(["-c", NOISY_ENGINE])
                .with_stderr(StderrMode::Log),
        );

        let (received, _) = run_until_engine_exits(&config).await;
        assert_eq!(received, b"uciok\n");

        // The stderr reader runs on its own and may finish after teardown.
        let logged = tokio::time::timeout(Duration::from_secs(5), async {
            while !logs.contents().contains("info string NNUE file missing") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(logged.is_ok(), "logs: {}", logs.contents());
    }

    #[tokio::test]
    async fn engine_stderr_is_discarded_by_default() {
        let (logs, _guard) = capture_logs();
        let (received, _) = run_until_engine_exits(&config(NOISY_ENGINE)).await;
        assert_eq!(received, b"uciok\n");
        assert!(!logs.contents().contains("NNUE"));
    }

    #[tokio::test]
    async fn heavy_stderr_does_not_stall_engine() {
        // More than a pipe buffer of stderr; an unread pipe would block the
        // engine before it ever reaches stdout.
        let script = "head -c 200000 /dev/zero | tr '\\0' 'x' | fold -w 100 >&2; echo uciok";
        for stderr in [StderrMode::Discard, StderrMode::Log] {
            let config = ListenerConfig::new(
                "127.0.0.1:0".parse().unwrap(),
                EngineCommand::new("/bin/sh")
                    .with_args(["-c", script])
                    .with_stderr(stderr),
            );
            let (received, _) = run_until_engine_exits(&config).await;
            assert_eq!(received, b"uciok\n", "{stderr:?}");
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_returned() {
        let config = ListenerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            EngineCommand::new("/definitely/not/an/engine"),
        );
        let (conn, _client) = tokio::io::duplex(64);
        let err = handle_connection(conn, peer(), &config, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SpawnFailed { .. }));
    }
}
