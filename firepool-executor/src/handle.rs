//! VM handle, its read-only projection, and exit tracking.

use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use firepool_core::VmId;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::Machine;
use crate::image::Lease;

/// How a hypervisor process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitState {
    /// Exit status zero: the guest shut down on its own.
    Clean,
    /// Non-zero status, a signal, or a lost reaper.
    Failed(String),
}

/// Shared view of a hypervisor process's exit.
///
/// Clones observe the same process. Waiting never consumes the exit, so any
/// number of tasks may wait concurrently.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitState>>,
    terminate: CancellationToken,
    kill: CancellationToken,
}

/// Producer side of an [`ExitWatch`] for backends that do not own a
/// child process.
#[derive(Debug)]
pub struct ExitSignal {
    tx: watch::Sender<Option<ExitState>>,
    terminate: CancellationToken,
    kill: CancellationToken,
}

impl ExitSignal {
    /// Publish the exit. Later calls are ignored.
    pub fn exit(&self, state: ExitState) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(state);
            true
        });
    }

    /// Resolves once a graceful stop was requested through the watch.
    pub async fn terminate_requested(&self) {
        self.terminate.cancelled().await;
    }

    /// Resolves once a kill was requested through the watch.
    pub async fn kill_requested(&self) {
        self.kill.cancelled().await;
    }
}

impl ExitWatch {
    /// Create an unattached watch and its producer.
    #[must_use]
    pub fn pair() -> (ExitSignal, Self) {
        let (tx, rx) = watch::channel(None);
        let terminate = CancellationToken::new();
        let kill = CancellationToken::new();
        (
            ExitSignal { tx, terminate: terminate.clone(), kill: kill.clone() },
            Self { rx, terminate, kill },
        )
    }

    /// Take ownership of a child process and reap it in the background.
    ///
    /// [`ExitWatch::terminate`] sends `SIGTERM` and [`ExitWatch::kill`]
    /// sends `SIGKILL` through the reaper.
    #[must_use]
    pub fn reap(mut child: Child) -> Self {
        let (signal, watch) = Self::pair();
        tokio::spawn(async move {
            let mut terminated = false;
            let status = loop {
                let event = tokio::select! {
                    status = child.wait() => Reaper::Exited(status),
                    () = signal.terminate_requested(), if !terminated => Reaper::Terminate,
                    () = signal.kill_requested() => Reaper::Kill,
                };
                match event {
                    Reaper::Exited(status) => break status,
                    Reaper::Terminate => {
                        terminated = true;
                        send_sigterm(&child);
                    }
                    Reaper::Kill => {
                        if let Err(e) = child.start_kill() {
                            tracing::debug!(error = %e, "kill of exited hypervisor process");
                        }
                        break child.wait().await;
                    }
                }
            };
            let state = match status {
                Ok(s) if s.success() => ExitState::Clean,
                Ok(s) => ExitState::Failed(s.to_string()),
                Err(e) => ExitState::Failed(format!("wait failed: {e}")),
            };
            signal.exit(state);
        });
        watch
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ExitState {
        let mut rx = self.rx.clone();
        let observed = rx.wait_for(Option::is_some).await.map(|slot| slot.clone());
        observed
            .ok()
            .flatten()
            .unwrap_or_else(|| ExitState::Failed("exit watcher dropped".to_owned()))
    }

    /// Exit state if the process already ended.
    #[must_use]
    pub fn exited(&self) -> Option<ExitState> {
        self.rx.borrow().clone()
    }

    /// Ask the process to shut down (`SIGTERM`).
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    /// Force the process down (`SIGKILL`).
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

enum Reaper {
    Exited(std::io::Result<std::process::ExitStatus>),
    Terminate,
    Kill,
}

fn send_sigterm(child: &Child) {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: the child has not been reaped yet, so `pid` still names it.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM to hypervisor process failed");
    }
}

/// Read-only projection of a live VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: VmId,
    pub name: String,
    pub pool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<IpAddr>,
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// A running VM and everything that must be released with it.
///
/// Owned by the manager's live table and never handed out; callers only
/// see [`VmInfo`].
#[derive(Debug)]
pub(crate) struct VmHandle {
    pub(crate) info: VmInfo,
    pub(crate) machine: Machine,
    pub(crate) lease: Lease,
    /// Kept open for the lifetime of the VM; dropped on destroy.
    pub(crate) log_file: Option<std::fs::File>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn signal_is_seen_by_every_clone() {
        let (signal, watch) = ExitWatch::pair();
        let other = watch.clone();
        assert_eq!(watch.exited(), None);
        signal.exit(ExitState::Clean);
        assert_eq!(watch.wait().await, ExitState::Clean);
        assert_eq!(other.wait().await, ExitState::Clean);
    }

    #[tokio::test]
    async fn first_exit_wins() {
        let (signal, watch) = ExitWatch::pair();
        signal.exit(ExitState::Failed("boom".to_owned()));
        signal.exit(ExitState::Clean);
        assert_eq!(watch.exited(), Some(ExitState::Failed("boom".to_owned())));
    }

    #[tokio::test]
    async fn dropped_signal_reports_failure() {
        let (signal, watch) = ExitWatch::pair();
        drop(signal);
        assert!(matches!(watch.wait().await, ExitState::Failed(_)));
    }

    #[tokio::test]
    async fn reaped_child_exit_is_clean() {
        let child = match tokio::process::Command::new("true").spawn() {
            Ok(c) => c,
            Err(e) => panic!("failed to spawn true: {e}"),
        };
        let watch = ExitWatch::reap(child);
        let state = tokio::time::timeout(Duration::from_secs(5), watch.wait()).await;
        assert_eq!(state.ok(), Some(ExitState::Clean));
    }

    #[tokio::test]
    async fn terminated_child_exits_on_sigterm() {
        let child = match tokio::process::Command::new("sleep").arg("30").spawn() {
            Ok(c) => c,
            Err(e) => panic!("failed to spawn sleep: {e}"),
        };
        let watch = ExitWatch::reap(child);
        watch.terminate();
        let state = tokio::time::timeout(Duration::from_secs(5), watch.wait()).await;
        match state {
            Ok(ExitState::Failed(reason)) => assert!(reason.contains("15") || reason.contains("SIGTERM"), "{reason}"),
            other => panic!("expected a SIGTERM exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn killed_child_exit_is_failure() {
        let child = match tokio::process::Command::new("sleep").arg("30").spawn() {
            Ok(c) => c,
            Err(e) => panic!("failed to spawn sleep: {e}"),
        };
        let watch = ExitWatch::reap(child);
        watch.kill();
        let state = tokio::time::timeout(Duration::from_secs(5), watch.wait()).await;
        assert!(matches!(state, Ok(ExitState::Failed(_))), "got {state:?}");
    }
}
