//! Error types for the executor crate.

use std::path::PathBuf;

use firepool_core::VmId;

/// Errors that can occur during VM lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// Firecracker (or another required binary) not found.
    #[error("binary not found at {path}")]
    BinaryNotFound { path: PathBuf },

    /// KVM device is not available or not accessible.
    #[error("KVM not available: {reason}")]
    KvmUnavailable { reason: String },

    /// VM failed to spawn or boot.
    #[error("VM spawn failed: {0}")]
    SpawnFailed(String),

    /// Firecracker API request failed.
    #[error("API request failed: {0}")]
    ApiError(String),

    /// The image engine cannot be reached.
    #[error("image engine unavailable: {0}")]
    EngineUnavailable(String),

    /// An image engine operation failed.
    #[error("image engine {operation} failed: {reason}")]
    Engine {
        operation: &'static str,
        reason: String,
    },

    /// The lease was already released or never existed.
    #[error("lease not found: {0}")]
    LeaseNotFound(String),

    /// CNI attachment or teardown failed.
    #[error("network setup failed: {0}")]
    Network(String),

    /// VM not found in the live table.
    #[error("VM not found: {0}")]
    VmNotFound(VmId),

    /// The hypervisor process exited with a failure status.
    #[error("VM {vm_id} exited abnormally: {reason}")]
    AbnormalExit { vm_id: VmId, reason: String },

    /// The caller stopped waiting before the VM exited.
    #[error("wait for VM {0} cancelled")]
    Cancelled(VmId),

    /// The manager has been closed and accepts no new VMs.
    #[error("VM manager is closed")]
    Closed,

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub(crate) fn engine(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Engine { operation, reason: reason.into() }
    }
}
