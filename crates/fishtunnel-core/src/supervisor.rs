//! Shutdown coordination for one handler instance.
//!
//! A handler (one connection plus its local stream) runs its execution units
//! under a [`Supervisor`]. The first unit to finish, an external liveness
//! source such as the engine process exiting, or cancellation of the parent
//! token ends the session:
//!
//! ```text
//! Running --first failure--> Draining --grace elapsed--> Teardown --> Terminated
//! ```
//!
//! Draining raises the handler's stop flag and waits at most one grace
//! period for the remaining units before aborting them. When the source of a
//! unit is already gone, the caller may first [`Supervisor::settle`] that
//! unit so buffered output is not dropped. Teardown of the
//! connection and process belongs to the caller, between
//! [`Supervisor::drain`] and [`Supervisor::finish`]. No unit is ever
//! restarted.

use std::fmt;
use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::relay::{UnitKind, UnitResult};

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Running,
    Draining,
    Teardown,
    Terminated,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationCause {
    /// An execution unit returned.
    UnitFinished(UnitKind),
    /// An execution unit panicked.
    UnitPanicked(UnitKind),
    /// The liveness source reported the child process gone.
    ProcessExited(Option<ExitStatus>),
    /// The parent token was cancelled (daemon or console shutdown).
    Shutdown,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnitFinished(unit) => write!(f, "{unit} finished"),
            Self::UnitPanicked(unit) => write!(f, "{unit} panicked"),
            Self::ProcessExited(Some(status)) => write!(f, "process exited ({status})"),
            Self::ProcessExited(None) => f.write_str("process exited"),
            Self::Shutdown => f.write_str("shutdown requested"),
        }
    }
}

/// Final result of one execution unit.
#[derive(Debug)]
pub struct UnitReport {
    pub unit: UnitKind,
    pub result: UnitResult,
}

/// What a finished session looked like.
#[derive(Debug)]
pub struct SessionReport {
    pub cause: TerminationCause,
    /// Units that returned by themselves, in completion order. Units aborted
    /// after the grace period are absent.
    pub units: Vec<UnitReport>,
}

impl SessionReport {
    /// Result reported by `unit`, if it returned before teardown.
    pub fn result_of(&self, unit: UnitKind) -> Option<&UnitResult> {
        self.units
            .iter()
            .find(|report| report.unit == unit)
            .map(|report| &report.result)
    }

    /// Errors that ended units abnormally.
    pub fn failures(&self) -> impl Iterator<Item = (UnitKind, &RelayError)> {
        self.units.iter().filter_map(|report| match &report.result {
            Ok(_) => None,
            Err(e) => Some((report.unit, e)),
        })
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// Runs the execution units of one handler and coordinates their shutdown.
pub struct Supervisor {
    label: String,
    cancel: CancellationToken,
    units: JoinSet<UnitReport>,
    spawned: Vec<(tokio::task::Id, UnitKind)>,
    reports: Vec<UnitReport>,
    state: SessionState,
    grace: Duration,
}

impl Supervisor {
    /// `label` identifies the handler in logs (usually the peer address).
    /// `cancel` is the handler's stop flag; pass a child of a role-wide token
    /// so shutdown of the role reaches every handler.
    pub fn new(label: impl Into<String>, cancel: CancellationToken, grace: Duration) -> Self {
        Self {
            label: label.into(),
            cancel,
            units: JoinSet::new(),
            spawned: Vec::new(),
            reports: Vec::new(),
            state: SessionState::Running,
            grace,
        }
    }

    /// Stop flag observed by every unit of this handler.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Start an execution unit.
    pub fn spawn<F>(&mut self, unit: UnitKind, future: F)
    where
        F: Future<Output = UnitResult> + Send + 'static,
    {
        let label = self.label.clone();
        let handle = self.units.spawn(async move {
            debug!(peer = %label, %unit, "starting datatransfer");
            let result = future.await;
            debug!(peer = %label, %unit, ?result, "stopping datatransfer");
            UnitReport { unit, result }
        });
        self.spawned.push((handle.id(), unit));
    }

    /// Wait in `Running` until the first unit finishes, `liveness`
    /// resolves, or the stop flag is raised from outside.
    ///
    /// Moves to `Draining` before returning.
    pub async fn wait_first<F>(&mut self, liveness: F) -> TerminationCause
    where
        F: Future<Output = TerminationCause>,
    {
        // An external stop wins over the units it makes return.
        let cause = tokio::select! {
            biased;
            () = self.cancel.cancelled() => TerminationCause::Shutdown,
            cause = liveness => cause,
            joined = self.units.join_next_with_id() => match joined {
                Some(Ok((_, report))) => {
                    let unit = report.unit;
                    self.reports.push(report);
                    TerminationCause::UnitFinished(unit)
                }
                Some(Err(e)) => TerminationCause::UnitPanicked(self.unit_of(e.id())),
                // Nothing was spawned; there is nothing left to relay.
                None => TerminationCause::Shutdown,
            },
        };
        self.transition(SessionState::Draining);
        cause
    }

    /// Give `unit` up to `within` to return by itself before the stop flag
    /// is raised, so it can forward what its source still has buffered.
    ///
    /// Only meaningful in `Draining`, between [`Self::wait_first`] and
    /// [`Self::drain`]. Other units that return meanwhile are recorded as
    /// usual. Returns whether `unit` returned in time.
    pub async fn settle(&mut self, unit: UnitKind, within: Duration) -> bool {
        debug_assert_eq!(self.state, SessionState::Draining);
        let deadline = tokio::time::Instant::now() + within;
        while !self.has_returned(unit) {
            match tokio::time::timeout_at(deadline, self.units.join_next_with_id()).await {
                Ok(Some(Ok((_, report)))) => self.reports.push(report),
                Ok(Some(Err(e))) => {
                    let failed = self.unit_of(e.id());
                    warn!(peer = %self.label, unit = %failed, error = %e, "unit did not stop cleanly");
                    if failed == unit {
                        return false;
                    }
                }
                Ok(None) => return false,
                Err(_) => {
                    debug!(peer = %self.label, %unit, "unit still busy after settle period");
                    return false;
                }
            }
        }
        true
    }

    /// Raise the stop flag and collect the remaining units, aborting any that
    /// are still running once the grace period is over.
    ///
    /// Moves to `Teardown`.
    pub async fn drain(&mut self) {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + self.grace;
        while !self.units.is_empty() {
            match tokio::time::timeout_at(deadline, self.units.join_next_with_id()).await {
                Ok(Some(Ok((_, report)))) => self.reports.push(report),
                Ok(Some(Err(e))) => {
                    warn!(peer = %self.label, unit = %self.unit_of(e.id()), error = %e, "unit did not stop cleanly");
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        peer = %self.label,
                        remaining = self.units.len(),
                        "aborting units still blocked after grace period"
                    );
                    self.units.shutdown().await;
                    break;
                }
            }
        }
        self.transition(SessionState::Teardown);
    }

    /// Log the outcome and move to `Terminated`.
    pub fn finish(mut self, cause: TerminationCause) -> SessionReport {
        self.transition(SessionState::Terminated);
        let report = SessionReport {
            cause,
            units: std::mem::take(&mut self.reports),
        };
        for (unit, error) in report.failures() {
            warn!(peer = %self.label, %unit, %error, "unit failed");
        }
        info!(peer = %self.label, cause = %report.cause, "session terminated");
        report
    }

    fn has_returned(&self, unit: UnitKind) -> bool {
        self.reports.iter().any(|report| report.unit == unit)
    }

    fn unit_of(&self, id: tokio::task::Id) -> UnitKind {
        self.spawned
            .iter()
            .find_map(|(spawned, unit)| (*spawned == id).then_some(*unit))
            .unwrap_or(UnitKind::StreamToConnection)
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "{:?} -> {next:?}", self.state);
        debug!(peer = %self.label, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}
