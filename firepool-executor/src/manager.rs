//! VM lifecycle manager: images, leases, snapshots, and the live VM table.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use firepool_core::{MetricsSink, VmId};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::backend::{LaunchRequest, Machine, VmmBackend};
use crate::config::{ManagerConfig, VmSpec};
use crate::handle::{ExitState, VmHandle, VmInfo};
use crate::image::{Image, ImageEngine, Lease};
use crate::recovery::{recover_stale_resources, RecoveryReport};
use crate::{mmds, ExecutorError};

/// VM lifecycle operations the pool controller depends on.
///
/// # Cancel Safety
/// `wait_for_exit` is cancel safe. `create_vm` and `destroy_vm` should run
/// to completion; dropping them midway can leave a lease behind.
#[async_trait]
pub trait VmLifecycle: Send + Sync {
    /// Boot a VM for `spec` and register it in the live table.
    ///
    /// # Errors
    /// Any failure after the lease is acquired releases it before returning.
    async fn create_vm(&self, spec: &VmSpec) -> Result<VmInfo, ExecutorError>;

    /// Tear down a VM. Unknown ids are a successful no-op.
    ///
    /// # Errors
    /// Never fails in practice; cleanup problems are logged.
    async fn destroy_vm(&self, id: &VmId) -> Result<(), ExecutorError>;

    /// Block until the VM's hypervisor exits or `cancel` fires.
    ///
    /// # Errors
    /// [`ExecutorError::AbnormalExit`] for a failed exit,
    /// [`ExecutorError::Cancelled`] when `cancel` fired first,
    /// [`ExecutorError::VmNotFound`] for unknown ids.
    async fn wait_for_exit(&self, id: &VmId, cancel: &CancellationToken) -> Result<(), ExecutorError>;

    async fn get_vm(&self, id: &VmId) -> Option<VmInfo>;

    async fn list_vms(&self) -> Vec<VmInfo>;

    /// Stop accepting VMs and release the engine client.
    ///
    /// # Errors
    /// Propagates the engine's close error.
    async fn close(&self) -> Result<(), ExecutorError>;
}

/// Drives a [`VmmBackend`] and an [`ImageEngine`] to create and destroy VMs.
///
/// The live table and the image engine are guarded independently; image
/// pull, lease, and snapshot calls are serialized so two creates never pull
/// the same reference at once.
pub struct VmManager<B: VmmBackend, E: ImageEngine> {
    backend: B,
    engine: E,
    config: ManagerConfig,
    metrics: Arc<dyn MetricsSink>,
    vms: RwLock<HashMap<VmId, VmHandle>>,
    image_lock: Mutex<()>,
    closed: AtomicBool,
    recovery: RecoveryReport,
}

impl<B: VmmBackend, E: ImageEngine> VmManager<B, E> {
    /// Create a manager and recover stale resources from earlier runs.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] if the pool root cannot be created and
    /// [`ExecutorError::EngineUnavailable`] if the image engine is unreachable.
    pub async fn new(
        config: ManagerConfig,
        backend: B,
        engine: E,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ExecutorError> {
        tokio::fs::create_dir_all(&config.pool_root).await?;
        engine.health_check().await?;

        if let Err(e) = backend.health_check().await {
            tracing::warn!(error = %e, "VMM backend not ready; VM creation will fail until fixed");
        }

        let mut recovery = recover_stale_resources(&config.pool_root).await;
        release_orphaned_leases(&engine, &config, &mut recovery).await;
        if !recovery.removed.is_empty() || !recovery.released_leases.is_empty() {
            tracing::info!(
                removed = recovery.removed.len(),
                released_leases = recovery.released_leases.len(),
                live = recovery.live.len(),
                "recovered stale VM resources"
            );
        }

        Ok(Self {
            backend,
            engine,
            config,
            metrics,
            vms: RwLock::new(HashMap::new()),
            image_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            recovery,
        })
    }

    /// What the startup recovery scan found.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Ensure the image, take a lease, and prepare the root snapshot.
    ///
    /// Returns the lease and the root device path. Releases the lease itself
    /// if snapshot preparation fails.
    async fn prepare_rootfs(&self, spec: &VmSpec, vm_id: &VmId) -> Result<(Lease, PathBuf), ExecutorError> {
        let _guard = self.image_lock.lock().await;
        let ns = spec.pool.as_str();

        let image = match self.engine.get_image(ns, &spec.image).await? {
            Some(image) => {
                tracing::debug!(image = %spec.image, namespace = ns, "image already present");
                image
            }
            None => {
                tracing::info!(image = %spec.image, namespace = ns, "pulling image");
                let start = Instant::now();
                let image = self.engine.pull(ns, &spec.image).await?;
                let elapsed = start.elapsed();
                self.metrics.image_pulled(ns, elapsed);
                tracing::info!(image = %spec.image, namespace = ns, ?elapsed, "image pulled");
                image
            }
        };

        let lease_id = self.config.lease_id(ns, vm_id.as_str());
        let lease = self.engine.create_lease(ns, &lease_id).await?;

        match self.prepare_snapshot(ns, &image, &lease, vm_id.as_str()).await {
            Ok(rootfs) => Ok((lease, rootfs)),
            Err(e) => {
                self.release_lease(&lease).await;
                Err(e)
            }
        }
    }

    /// Create (or reuse) the VM's writable snapshot and return its device.
    async fn prepare_snapshot(
        &self,
        ns: &str,
        image: &Image,
        lease: &Lease,
        key: &str,
    ) -> Result<PathBuf, ExecutorError> {
        if !self.engine.snapshot_exists(ns, key).await? {
            let parent = self.engine.rootfs_chain_id(ns, image).await?;
            if !self.engine.snapshot_exists(ns, &parent).await? {
                tracing::debug!(image = %image.name, "unpacking image");
                self.engine.unpack(ns, image).await?;
            }
            self.engine.prepare_snapshot(lease, key, &parent).await?;
        }
        let mounts = self.engine.snapshot_mounts(ns, key).await?;
        mounts
            .into_iter()
            .next()
            .map(|m| PathBuf::from(m.source))
            .ok_or_else(|| ExecutorError::engine("snapshots mounts", format!("no mounts for {key}")))
    }

    async fn boot(
        &self,
        spec: &VmSpec,
        vm_id: &VmId,
        pool_dir: &Path,
        rootfs: PathBuf,
    ) -> Result<(VmInfo, Machine, std::fs::File), ExecutorError> {
        let log_path = pool_dir.join(format!("{vm_id}.log"));
        let socket_path = pool_dir.join(format!("{vm_id}.sock"));

        let log_file = tokio::fs::File::create(&log_path).await?.into_std().await;
        let request = LaunchRequest {
            vm_id: vm_id.clone(),
            socket_path: socket_path.clone(),
            log_file: Some(log_file.try_clone()?),
            kernel_path: spec.kernel_path.clone(),
            kernel_args: spec.kernel_args.clone(),
            vcpu_count: spec.vcpu_count,
            mem_size_mib: spec.mem_size_mib,
            rootfs_path: rootfs,
            metadata: (!spec.metadata.is_empty()).then(|| mmds::build_document(&spec.metadata)),
        };

        let machine = self.backend.launch(request).await?;
        let info = VmInfo {
            id: vm_id.clone(),
            name: spec.name.clone(),
            pool: spec.pool.clone(),
            ip_address: machine.ip_address,
            socket_path,
            log_path,
            created_at: Utc::now(),
        };
        Ok((info, machine, log_file))
    }

    async fn release_lease(&self, lease: &Lease) {
        match tokio::time::timeout(self.config.lease_timeout, self.engine.cancel_lease(lease)).await {
            Ok(Ok(()) | Err(ExecutorError::LeaseNotFound(_))) => {}
            Ok(Err(e)) => tracing::warn!(lease = %lease.id, error = %e, "failed to release lease"),
            Err(_) => tracing::warn!(lease = %lease.id, "timed out releasing lease"),
        }
    }
}

/// Release leases, and the snapshots they protect, left behind by VMs of an
/// earlier process. Leases of VMs whose control socket still answers are
/// kept.
async fn release_orphaned_leases<E: ImageEngine>(engine: &E, config: &ManagerConfig, report: &mut RecoveryReport) {
    let live: HashSet<&str> = report.live.iter().filter_map(|p| p.file_stem()?.to_str()).collect();
    let mut released = Vec::new();

    for pool in &report.pools {
        let prefix = config.lease_id(pool, "");
        let leases = match engine.list_leases(pool, &prefix).await {
            Ok(leases) => leases,
            Err(e) => {
                tracing::warn!(pool = %pool, error = %e, "failed to list leases");
                continue;
            }
        };
        for lease in leases {
            let Some(vm_id) = lease.id.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if vm_id.is_empty() || live.contains(vm_id) {
                continue;
            }
            tracing::info!(lease = %lease.id, "releasing orphaned lease");
            if let Err(e) = engine.remove_snapshot(pool, vm_id).await {
                tracing::warn!(snapshot = %vm_id, error = %e, "failed to remove orphaned snapshot");
            }
            let cancelled = tokio::time::timeout(config.lease_timeout, engine.cancel_lease(&lease)).await;
            match cancelled {
                Ok(Ok(()) | Err(ExecutorError::LeaseNotFound(_))) => released.push(lease.id),
                Ok(Err(e)) => tracing::warn!(lease = %lease.id, error = %e, "failed to release orphaned lease"),
                Err(_) => tracing::warn!(lease = %lease.id, "timed out releasing orphaned lease"),
            }
        }
    }
    report.released_leases = released;
}

#[async_trait]
impl<B: VmmBackend, E: ImageEngine> VmLifecycle for VmManager<B, E> {
    async fn create_vm(&self, spec: &VmSpec) -> Result<VmInfo, ExecutorError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutorError::Closed);
        }

        let vm_id = VmId::derive(&spec.id);
        tracing::info!(
            vm_id = %vm_id,
            pool = %spec.pool,
            mem_size_mib = spec.mem_size_mib,
            vcpu_count = spec.vcpu_count,
            "creating VM"
        );

        let pool_dir = self.config.pool_dir(&spec.pool);
        tokio::fs::create_dir_all(&pool_dir).await?;

        let (lease, rootfs) = self.prepare_rootfs(spec, &vm_id).await?;

        let (info, machine, log_file) = match self.boot(spec, &vm_id, &pool_dir, rootfs).await {
            Ok(booted) => booted,
            Err(e) => {
                self.release_lease(&lease).await;
                return Err(e);
            }
        };

        tracing::info!(vm_id = %vm_id, ip = ?info.ip_address, "VM started");
        let handle = VmHandle { info: info.clone(), machine, lease, log_file: Some(log_file) };
        self.vms.write().await.insert(vm_id, handle);
        Ok(info)
    }

    async fn destroy_vm(&self, id: &VmId) -> Result<(), ExecutorError> {
        // Unregister first so concurrent lookups fail fast.
        let Some(mut handle) = self.vms.write().await.remove(id) else {
            return Ok(());
        };
        tracing::info!(vm_id = %id, "destroying VM");

        if let Err(e) = self.backend.stop(id, &handle.machine).await {
            tracing::warn!(vm_id = %id, error = %e, "failed to stop VMM");
        }
        if tokio::time::timeout(self.config.stop_grace, handle.machine.exit.wait()).await.is_err() {
            tracing::warn!(vm_id = %id, grace_secs = self.config.stop_grace.as_secs(), "VMM did not exit within grace period, killing");
            handle.machine.exit.kill();
            if tokio::time::timeout(self.config.stop_grace, handle.machine.exit.wait()).await.is_err() {
                tracing::warn!(vm_id = %id, "VMM did not exit after kill");
            }
        }
        if let Err(e) = self.backend.teardown(id, &handle.machine).await {
            tracing::warn!(vm_id = %id, error = %e, "failed to release VM network");
        }

        self.release_lease(&handle.lease).await;
        drop(handle.log_file.take());

        match tokio::fs::remove_file(&handle.info.socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(vm_id = %id, error = %e, "failed to remove control socket"),
        }

        tracing::info!(vm_id = %id, "VM destroyed");
        Ok(())
    }

    async fn wait_for_exit(&self, id: &VmId, cancel: &CancellationToken) -> Result<(), ExecutorError> {
        let exit = self
            .vms
            .read()
            .await
            .get(id)
            .map(|h| h.machine.exit.clone())
            .ok_or_else(|| ExecutorError::VmNotFound(id.clone()))?;

        tokio::select! {
            state = exit.wait() => match state {
                ExitState::Clean => Ok(()),
                ExitState::Failed(reason) => Err(ExecutorError::AbnormalExit { vm_id: id.clone(), reason }),
            },
            () = cancel.cancelled() => Err(ExecutorError::Cancelled(id.clone())),
        }
    }

    async fn get_vm(&self, id: &VmId) -> Option<VmInfo> {
        self.vms.read().await.get(id).map(|h| h.info.clone())
    }

    async fn list_vms(&self) -> Vec<VmInfo> {
        let mut vms: Vec<VmInfo> = self.vms.read().await.values().map(|h| h.info.clone()).collect();
        vms.sort_by(|a, b| a.id.cmp(&b.id));
        vms
    }

    async fn close(&self) -> Result<(), ExecutorError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let remaining = self.vms.read().await.len();
        if remaining > 0 {
            tracing::warn!(remaining, "closing VM manager with live VMs");
        }
        self.engine.close().await
    }
}
