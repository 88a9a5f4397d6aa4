//! VMM backend abstraction trait.
//!
//! The manager owns images, leases, and bookkeeping; a backend only turns a
//! prepared root filesystem into a running guest and back.

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use firepool_core::VmId;

use crate::cni::Attachment;
use crate::handle::ExitWatch;
use crate::ExecutorError;

/// Everything a backend needs to boot one VM.
#[derive(Debug)]
#[non_exhaustive]
pub struct LaunchRequest {
    pub vm_id: VmId,
    /// Control socket path the hypervisor must bind.
    pub socket_path: PathBuf,
    /// Hypervisor stdout and stderr go here.
    pub log_file: Option<std::fs::File>,
    pub kernel_path: PathBuf,
    pub kernel_args: String,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    /// Block device or image backing the root drive.
    pub rootfs_path: PathBuf,
    /// Metadata service document, if the guest gets one.
    pub metadata: Option<serde_json::Value>,
}

/// A booted guest as seen by its backend.
#[derive(Debug)]
#[non_exhaustive]
pub struct Machine {
    pub socket_path: PathBuf,
    pub ip_address: Option<IpAddr>,
    pub exit: ExitWatch,
    /// Network the guest is attached to, released on teardown.
    pub network: Option<Attachment>,
}

impl Machine {
    #[must_use]
    pub fn new(socket_path: PathBuf, exit: ExitWatch) -> Self {
        Self { socket_path, ip_address: None, exit, network: None }
    }

    #[must_use]
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    #[must_use]
    pub fn with_network(mut self, attachment: Attachment) -> Self {
        self.ip_address = Some(IpAddr::V4(attachment.address));
        self.network = Some(attachment);
        self
    }
}

/// Virtual Machine Manager abstraction.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
#[async_trait]
pub trait VmmBackend: Send + Sync {
    /// Boot a VM.
    ///
    /// Anything the backend set up is released before an error returns.
    ///
    /// # Errors
    /// Returns [`ExecutorError::SpawnFailed`] if the process cannot be started
    /// or configured, [`ExecutorError::Network`] if network attachment fails.
    async fn launch(&self, request: LaunchRequest) -> Result<Machine, ExecutorError>;

    /// Ask the hypervisor to stop gracefully. Does not wait for the exit;
    /// the caller escalates to [`ExitWatch::kill`](crate::ExitWatch::kill)
    /// after its grace period.
    ///
    /// # Errors
    /// Backend specific; the caller logs and continues.
    async fn stop(&self, vm_id: &VmId, machine: &Machine) -> Result<(), ExecutorError>;

    /// Release backend resources of a stopped VM (network, sockets).
    ///
    /// # Errors
    /// Returns the first failure after attempting every step.
    async fn teardown(&self, vm_id: &VmId, machine: &Machine) -> Result<(), ExecutorError>;

    /// Check if the backend is available and properly configured.
    ///
    /// # Errors
    /// Returns [`ExecutorError::BinaryNotFound`] or [`ExecutorError::KvmUnavailable`]
    /// if the environment is not ready.
    async fn health_check(&self) -> Result<(), ExecutorError>;
}
