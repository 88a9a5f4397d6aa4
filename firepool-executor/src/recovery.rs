//! Stale resource recovery after an unclean shutdown.
//!
//! A control socket with nothing listening behind it belongs to a
//! hypervisor that died with the previous orchestrator process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;

/// How long a liveness probe may take before the socket counts as stale.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Outcome of a recovery scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sockets (and their paired logs) removed as orphaned.
    pub removed: Vec<PathBuf>,
    /// Sockets left alone because a process still answers on them.
    pub live: Vec<PathBuf>,
    /// Pool directories found under the root.
    pub pools: Vec<String>,
    /// Engine leases released because their VM is gone.
    pub released_leases: Vec<String>,
}

/// Scan every pool directory under `root` and remove orphaned sockets
/// together with their `.log` files.
///
/// Unreadable directories and failed removals are logged and skipped.
pub async fn recover_stale_resources(root: &Path) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let mut pools = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %root.display(), error = %e, "failed to read pool root");
            return report;
        }
    };

    loop {
        let entry = match pools.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %root.display(), error = %e, "failed to list pool root");
                break;
            }
        };
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            if let Some(pool) = entry.file_name().to_str() {
                report.pools.push(pool.to_owned());
            }
            recover_pool_dir(&entry.path(), &mut report).await;
        }
    }
    report
}

async fn recover_pool_dir(dir: &Path, report: &mut RecoveryReport) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to read pool directory");
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sock") {
            continue;
        }
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            continue;
        }

        if is_socket_live(&path).await {
            tracing::debug!(socket = %path.display(), "socket still active, leaving it");
            report.live.push(path);
            continue;
        }

        tracing::info!(socket = %path.display(), "removing stale socket");
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(socket = %path.display(), error = %e, "failed to remove stale socket");
            continue;
        }

        let log_path = path.with_extension("log");
        match tokio::fs::remove_file(&log_path).await {
            Ok(()) => tracing::info!(log = %log_path.display(), "removed stale log"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(log = %log_path.display(), error = %e, "failed to remove stale log"),
        }
        report.removed.push(path);
    }
}

/// `true` if something accepts connections on the socket.
pub async fn is_socket_live(path: &Path) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(path)).await,
        Ok(Ok(_))
    )
}
