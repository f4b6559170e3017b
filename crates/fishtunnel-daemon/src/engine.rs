//! Engine process spawning.
//!
//! Each accepted connection gets its own engine process with stdin and
//! stdout piped. stderr is never relayed: it is discarded, or read and
//! logged when [`StderrMode::Log`] is selected.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::error::EngineError;

/// What happens to the engine's stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StderrMode {
    #[default]
    Discard,
    /// Log each line at debug level.
    Log,
}

/// How to start the engine.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    program: PathBuf,
    args: Vec<String>,
    stderr: StderrMode,
}

impl EngineCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stderr: StderrMode::default(),
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The executable must exist and be a regular file.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.program.is_file() {
            Ok(())
        } else {
            Err(EngineError::NotFound {
                path: self.program.clone(),
            })
        }
    }

    /// Start a fresh engine process.
    pub fn spawn(&self) -> Result<Engine, EngineError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match self.stderr {
                StderrMode::Discard => Stdio::null(),
                StderrMode::Log => Stdio::piped(),
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| EngineError::SpawnFailed {
            path: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(program = %self.program.display(), ?pid, "Spawned engine");

        let stdin = child.stdin.take().ok_or(EngineError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(EngineError::MissingPipe("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(?pid, "engine stderr: {}", line);
                }
                debug!(?pid, "engine stderr reader finished");
            });
        }

        Ok(Engine {
            child,
            stdin,
            stdout,
            pid,
        })
    }
}

/// A running engine with its pipes taken out of the child handle.
#[derive(Debug)]
pub struct Engine {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub pid: Option<u32>,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_is_rejected() {
        let dir = std::env::temp_dir().join("fishtunnel-no-such-engine");
        let err = EngineCommand::new(&dir).validate().unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert!(err.to_string().starts_with("Engine "));
    }

    #[test]
    fn directory_is_not_an_engine() {
        let dir = std::env::temp_dir();
        assert!(EngineCommand::new(dir).validate().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn existing_file_passes_validation() {
        EngineCommand::new("/bin/sh").validate().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_engine_speaks_over_pipes() {
        use tokio::io::AsyncWriteExt;

        let mut engine = EngineCommand::new("/bin/sh")
            .with_args(["-c", "read line; echo \"got $line\""])
            .spawn()
            .unwrap();
        assert!(engine.pid.is_some());

        engine.stdin.write_all(b"uci\n").await.unwrap();
        engine.stdin.flush().await.unwrap();
        let mut lines = BufReader::new(engine.stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("got uci"));
        assert!(engine.child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn spawn_failure_names_program() {
        let err = EngineCommand::new("/definitely/not/here")
            .spawn()
            .unwrap_err();
        assert!(matches!(err, EngineError::SpawnFailed { .. }));
        assert!(err.to_string().contains("/definitely/not/here"));
    }
}
