use courier_core::{ExitReport, StopSignal};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Termination progress of a supervised agent process.
///
/// `Running → SignalSent(Graceful) → {Exited | SignalSent(Forceful)} → Exited`.
/// Escalation is driven by the grace-period timer in [`ProcessSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    SignalSent(StopSignal),
    Exited,
}

impl TerminationState {
    /// State after a stop request (from `Running`) or an expired grace
    /// period (from `SignalSent(Graceful)`).
    pub fn escalate(self) -> Self {
        match self {
            Self::Running => Self::SignalSent(StopSignal::Graceful),
            Self::SignalSent(StopSignal::Graceful) => Self::SignalSent(StopSignal::Forceful),
            other => other,
        }
    }
}

/// Owns an agent child process and its process group until exit.
#[derive(Debug)]
pub(crate) struct ProcessSupervisor {
    child: Child,
    pgid: Option<i32>,
    grace: Duration,
    state: TerminationState,
}

impl ProcessSupervisor {
    /// The child must have been spawned as the leader of its own process
    /// group, so its pid doubles as the group id.
    pub(crate) fn new(child: Child, grace: Duration) -> Self {
        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        Self {
            child,
            pgid,
            grace,
            state: TerminationState::Running,
        }
    }

    /// Wait for the process to exit, terminating its group if `cancel` fires.
    pub(crate) async fn supervise(mut self, cancel: CancellationToken) -> ExitReport {
        loop {
            match self.state {
                TerminationState::Running => {
                    tokio::select! {
                        status = self.child.wait() => return self.exited(status),
                        () = cancel.cancelled() => {
                            info!(pgid = ?self.pgid, "stop requested, terminating agent process group");
                            self.escalate();
                        }
                    }
                }
                TerminationState::SignalSent(StopSignal::Graceful) => {
                    tokio::select! {
                        status = self.child.wait() => return self.exited(status),
                        () = tokio::time::sleep(self.grace) => {
                            warn!(
                                pgid = ?self.pgid,
                                grace_ms = self.grace.as_millis(),
                                "agent did not exit within grace period, killing process group"
                            );
                            self.escalate();
                        }
                    }
                }
                TerminationState::SignalSent(StopSignal::Forceful) => {
                    let status = self.child.wait().await;
                    return self.exited(status);
                }
                TerminationState::Exited => return ExitReport::default(),
            }
        }
    }

    fn stopped_by(&self) -> Option<StopSignal> {
        match self.state {
            TerminationState::SignalSent(signal) => Some(signal),
            TerminationState::Running | TerminationState::Exited => None,
        }
    }

    fn escalate(&mut self) {
        self.state = self.state.escalate();
        if let TerminationState::SignalSent(signal) = self.state {
            self.signal_group(signal);
        }
    }

    fn exited(&mut self, status: std::io::Result<ExitStatus>) -> ExitReport {
        let stopped_by = self.stopped_by();
        self.state = TerminationState::Exited;
        match status {
            Ok(status) => {
                debug!(code = ?status.code(), ?stopped_by, "agent process exited");
                ExitReport {
                    code: status.code(),
                    stopped_by,
                }
            }
            Err(error) => {
                warn!(error = %error, "failed to wait for agent process");
                ExitReport {
                    code: None,
                    stopped_by,
                }
            }
        }
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: StopSignal) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid else {
            let _ = self.child.start_kill();
            return;
        };
        let sig = match signal {
            StopSignal::Graceful => Signal::SIGTERM,
            StopSignal::Forceful => Signal::SIGKILL,
        };
        if let Err(errno) = killpg(Pid::from_raw(pgid), sig) {
            // ESRCH: the whole group is already gone.
            debug!(pgid, signal = %sig, error = %errno, "killpg failed");
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: StopSignal) {
        let _ = self.child.start_kill();
    }
}
