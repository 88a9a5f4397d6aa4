//! Firecracker VMM backend implementation.
//!
//! Manages Firecracker microVM processes via the Firecracker Management API
//! (HTTP over Unix domain socket).
//!
//! # API Reference
//! Firecracker API spec: `firecracker/src/api_server/swagger/firecracker.yaml`

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use firepool_core::VmId;
use hyper::Method;
use serde_json::json;
use tokio::process::Command;

use crate::backend::{LaunchRequest, Machine, VmmBackend};
use crate::cni::{Attachment, CniNetwork, DEFAULT_IFNAME};
use crate::handle::ExitWatch;
use crate::mmds;
use crate::unix_client::api_request;
use crate::ExecutorError;

/// Locations searched when no binary path is configured.
const WELL_KNOWN_BINARIES: [&str; 3] = [
    "/usr/bin/firecracker",
    "/usr/local/bin/firecracker",
    "/opt/firecracker/firecracker",
];

/// Firecracker VMM backend.
///
/// Spawns and manages Firecracker microVM processes, communicating
/// with each via its Unix socket management API. With a network configured,
/// every VM runs inside its own CNI-managed network namespace.
#[derive(Debug, Clone)]
pub struct FirecrackerBackend {
    /// Path to the `firecracker` binary.
    binary_path: PathBuf,

    network: Option<CniNetwork>,

    ip_binary: PathBuf,
}

impl FirecrackerBackend {
    /// Create a backend using the given binary, or the first well-known
    /// location that exists.
    #[must_use]
    pub fn new(binary_path: Option<PathBuf>) -> Self {
        let binary_path = binary_path.unwrap_or_else(|| {
            WELL_KNOWN_BINARIES
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .unwrap_or_else(|| PathBuf::from("firecracker"))
        });
        Self { binary_path, network: None, ip_binary: PathBuf::from("ip") }
    }

    /// Attach every VM to the given CNI network.
    #[must_use]
    pub fn with_network(mut self, network: CniNetwork) -> Self {
        self.network = Some(network);
        self
    }

    #[must_use]
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Wait for the Firecracker API socket to become available.
    async fn wait_for_socket(socket_path: &Path, exit: &ExitWatch) -> Result<(), ExecutorError> {
        for _ in 0..50u8 {
            if socket_path.exists() {
                return Ok(());
            }
            if let Some(state) = exit.exited() {
                return Err(ExecutorError::SpawnFailed(format!(
                    "firecracker exited before creating its socket: {state:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(ExecutorError::SpawnFailed(format!(
            "socket {} did not appear within 5s",
            socket_path.display()
        )))
    }

    fn command(&self, request: &LaunchRequest, attachment: Option<&Attachment>) -> Result<Command, ExecutorError> {
        let mut cmd = match attachment {
            Some(net) => {
                let mut cmd = Command::new(&self.ip_binary);
                cmd.args(["netns", "exec", net.netns.as_str()]).arg(&self.binary_path);
                cmd
            }
            None => Command::new(&self.binary_path),
        };
        cmd.arg("--api-sock").arg(&request.socket_path).stdin(Stdio::null());

        match &request.log_file {
            Some(log) => {
                cmd.stdout(log.try_clone()?).stderr(log.try_clone()?);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        // Own process group: terminal signals reach only the orchestrator.
        cmd.process_group(0).kill_on_drop(true);
        Ok(cmd)
    }

    /// Configure the VM via the Firecracker API and boot it.
    async fn configure_and_boot(
        socket_path: &Path,
        request: &LaunchRequest,
        attachment: Option<&Attachment>,
    ) -> Result<(), ExecutorError> {
        let boot_args = match attachment {
            Some(net) => format!("{} {}", request.kernel_args, net.kernel_ip_arg()),
            None => request.kernel_args.clone(),
        };
        let kernel_body = json!({
            "kernel_image_path": request.kernel_path,
            "boot_args": boot_args,
        });
        api_request(socket_path, Method::PUT, "/boot-source", Some(&kernel_body)).await?;

        let rootfs_body = json!({
            "drive_id": "rootfs",
            "path_on_host": request.rootfs_path,
            "is_root_device": true,
            "is_read_only": false,
        });
        api_request(socket_path, Method::PUT, "/drives/rootfs", Some(&rootfs_body)).await?;

        let machine_body = json!({
            "vcpu_count": request.vcpu_count,
            "mem_size_mib": request.mem_size_mib,
        });
        api_request(socket_path, Method::PUT, "/machine-config", Some(&machine_body)).await?;

        if let Some(net) = attachment {
            let mut iface = json!({
                "iface_id": DEFAULT_IFNAME,
                "host_dev_name": net.tap,
            });
            if let Some(mac) = &net.guest_mac {
                iface["guest_mac"] = json!(mac);
            }
            let uri = format!("/network-interfaces/{DEFAULT_IFNAME}");
            api_request(socket_path, Method::PUT, &uri, Some(&iface)).await?;
        }

        if let Some(document) = &request.metadata {
            if attachment.is_none() {
                return Err(ExecutorError::SpawnFailed(
                    "guest metadata requires a network interface".to_owned(),
                ));
            }
            let config = mmds::service_config(DEFAULT_IFNAME);
            api_request(socket_path, Method::PUT, "/mmds/config", Some(&config)).await?;
            api_request(socket_path, Method::PUT, "/mmds", Some(document)).await?;
        }

        let boot_body = json!({ "action_type": "InstanceStart" });
        api_request(socket_path, Method::PUT, "/actions", Some(&boot_body)).await?;

        Ok(())
    }

    async fn release_network(&self, vm_id: &VmId, attachment: &Attachment) -> Result<(), ExecutorError> {
        match &self.network {
            Some(network) => network.detach(vm_id, attachment).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VmmBackend for FirecrackerBackend {
    async fn launch(&self, request: LaunchRequest) -> Result<Machine, ExecutorError> {
        which_binary(&self.binary_path)?;

        let attachment = match &self.network {
            Some(network) => Some(network.attach(&request.vm_id).await?),
            None => None,
        };

        tracing::info!(
            vm_id = %request.vm_id,
            socket = %request.socket_path.display(),
            ip = ?attachment.as_ref().map(|a| a.address),
            "spawning Firecracker VM"
        );

        let spawned = self
            .command(&request, attachment.as_ref())
            .and_then(|mut cmd| {
                cmd.spawn()
                    .map_err(|e| ExecutorError::SpawnFailed(format!("exec firecracker: {e}")))
            });
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                if let Some(net) = &attachment {
                    if let Err(err) = self.release_network(&request.vm_id, net).await {
                        tracing::warn!(vm_id = %request.vm_id, error = %err, "network release failed");
                    }
                }
                return Err(e);
            }
        };
        let exit = ExitWatch::reap(child);

        let booted = match Self::wait_for_socket(&request.socket_path, &exit).await {
            Ok(()) => Self::configure_and_boot(&request.socket_path, &request, attachment.as_ref())
                .await
                .map_err(|e| ExecutorError::SpawnFailed(e.to_string())),
            Err(e) => Err(e),
        };

        if let Err(e) = booted {
            exit.kill();
            let _ = exit.wait().await;
            if let Some(net) = &attachment {
                if let Err(err) = self.release_network(&request.vm_id, net).await {
                    tracing::warn!(vm_id = %request.vm_id, error = %err, "network release failed");
                }
            }
            let _ = tokio::fs::remove_file(&request.socket_path).await;
            return Err(e);
        }

        tracing::info!(vm_id = %request.vm_id, "VM booted successfully");

        let machine = Machine::new(request.socket_path, exit);
        Ok(match attachment {
            Some(net) => machine.with_network(net),
            None => machine,
        })
    }

    async fn stop(&self, vm_id: &VmId, machine: &Machine) -> Result<(), ExecutorError> {
        tracing::debug!(vm_id = %vm_id, "stopping VMM");
        machine.exit.terminate();
        Ok(())
    }

    async fn teardown(&self, vm_id: &VmId, machine: &Machine) -> Result<(), ExecutorError> {
        match &machine.network {
            Some(net) => self.release_network(vm_id, net).await,
            None => Ok(()),
        }
    }

    async fn health_check(&self) -> Result<(), ExecutorError> {
        // Check KVM
        if !Path::new("/dev/kvm").exists() {
            return Err(ExecutorError::KvmUnavailable {
                reason: "/dev/kvm not found".to_owned(),
            });
        }

        tokio::fs::metadata("/dev/kvm").await.map_err(|_| ExecutorError::KvmUnavailable {
            reason: "cannot access /dev/kvm (permission denied?)".to_owned(),
        })?;

        which_binary(&self.binary_path)?;

        Ok(())
    }
}

/// Verify a binary exists either at the given path or in PATH.
fn which_binary(path: &Path) -> Result<(), ExecutorError> {
    if path.is_absolute() {
        if path.exists() {
            return Ok(());
        }
        return Err(ExecutorError::BinaryNotFound { path: path.to_owned() });
    }

    let found = std::env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .map(|dir| Path::new(dir).join(path))
        .any(|p| p.exists());

    if found {
        Ok(())
    } else {
        Err(ExecutorError::BinaryNotFound { path: path.to_owned() })
    }
}
