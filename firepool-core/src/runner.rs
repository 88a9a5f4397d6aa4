use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{RunnerId, VmId};

/// Lifecycle state of a runner record.
///
/// `Starting → Idle → Busy → Stopping → Stopped`, with `Failed` reachable
/// from `Starting` or whenever the monitored VM exits abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    /// Provider identity is being minted or the VM is booting.
    Starting,
    /// VM is up and the runner is waiting for a job.
    Idle,
    /// The runner is executing a job.
    Busy,
    /// The VM is being torn down.
    Stopping,
    /// Torn down after a clean exit or shutdown.
    Stopped,
    /// Registration, boot, or the VM itself failed.
    Failed,
}

impl RunnerState {
    /// `Stopped` and `Failed` records are purged on the next reconciliation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One-time runner authentication token returned by the CI provider.
///
/// The token is unrecoverable after registration and must reach exactly one
/// VM. `Debug` and `Display` never print it.
#[derive(Clone, PartialEq, Eq)]
pub struct RunnerToken(String);

impl RunnerToken {
    /// Wraps a raw token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token. Only metadata assembly should call this.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the provider sent an empty token.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RunnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RunnerToken(<redacted>)")
    }
}

impl fmt::Display for RunnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Read-only projection of a runner record.
///
/// Carries no token field at all, so a status listing cannot leak one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerInfo {
    pub id: RunnerId,
    pub name: String,
    pub status: RunnerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<VmId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<IpAddr>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_runner_id: Option<u64>,
}

/// Per-state runner counts of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerCounts {
    pub starting: usize,
    pub idle: usize,
    pub busy: usize,
    pub stopping: usize,
    pub stopped: usize,
    pub failed: usize,
}

impl RunnerCounts {
    /// Tallies the given states.
    pub fn tally(states: impl IntoIterator<Item = RunnerState>) -> Self {
        let mut counts = Self::default();
        for state in states {
            match state {
                RunnerState::Starting => counts.starting += 1,
                RunnerState::Idle => counts.idle += 1,
                RunnerState::Busy => counts.busy += 1,
                RunnerState::Stopping => counts.stopping += 1,
                RunnerState::Stopped => counts.stopped += 1,
                RunnerState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Records that are neither `Stopped` nor `Failed`.
    #[must_use]
    pub fn active(&self) -> usize {
        self.starting + self.idle + self.busy + self.stopping
    }

    /// Records that reconciliation will purge.
    #[must_use]
    pub fn terminal(&self) -> usize {
        self.stopped + self.failed
    }

    /// Total number of records.
    #[must_use]
    pub fn total(&self) -> usize {
        self.active() + self.terminal()
    }
}

/// Status snapshot of one pool, as served by the status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub name: String,
    pub min_runners: usize,
    pub max_runners: usize,
    pub active: bool,
    pub counts: RunnerCounts,
    pub runners: Vec<RunnerInfo>,
}
