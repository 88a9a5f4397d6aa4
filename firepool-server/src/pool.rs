//! Pool controller: keeps a pool at its warm-runner floor.
//!
//! Each pool reconciles on a timer and on a coalesced signal raised when a
//! runner finishes. A spawn mints a provider identity and boots a VM for it;
//! a monitor waits for that VM to exit, revokes the identity, and destroys
//! the VM. All mutation of the runner table happens under one lock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use firepool_core::id::{runner_name, system_id};
use firepool_core::metadata::METADATA_NAMESPACE;
use firepool_core::{
    MetricsSink, PoolConfig, PoolStatus, RunnerCounts, RunnerId, RunnerInfo, RunnerMetadata, RunnerState,
    RunnerToken, VmId,
};
use firepool_executor::{ExecutorError, VmLifecycle, VmSpec};
use firepool_provider::{RunnerOptions, RunnerProvider};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::ServerError;

/// Timing knobs of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Period of the reconciliation timer.
    pub reconcile_interval: Duration,
    /// Overall budget for provider deletions during shutdown.
    pub shutdown_timeout: Duration,
    /// Bound on a single VM destroy.
    pub destroy_timeout: Duration,
    /// Bound on one round of provider busy checks.
    pub busy_check_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            destroy_timeout: Duration::from_secs(15),
            busy_check_timeout: Duration::from_secs(10),
        }
    }
}

/// Object-safe view of a pool for the server registry and the API.
#[async_trait]
pub trait ManagedPool: Send + Sync {
    fn name(&self) -> &str;

    /// Scale to the floor and start the reconciliation loop.
    async fn start(&self);

    /// Quiesce all workers, revoke identities, and destroy every VM.
    async fn stop(&self);

    /// Stop scaling; running VMs are left alone.
    async fn pause(&self);

    async fn resume(&self);

    /// Token-free snapshot of the pool.
    async fn status(&self) -> PoolStatus;
}

/// Internal runner record. The token never leaves this struct except into
/// the guest metadata document.
#[derive(Debug)]
struct RunnerRecord {
    id: RunnerId,
    name: String,
    status: RunnerState,
    vm_id: Option<VmId>,
    ip_address: Option<IpAddr>,
    started_at: DateTime<Utc>,
    provider_runner_id: Option<u64>,
    token: Option<RunnerToken>,
    /// A provider delete was already attempted for this record.
    deregistered: bool,
}

impl RunnerRecord {
    fn new(id: RunnerId, name: String) -> Self {
        Self {
            id,
            name,
            status: RunnerState::Starting,
            vm_id: None,
            ip_address: None,
            started_at: Utc::now(),
            provider_runner_id: None,
            token: None,
            deregistered: false,
        }
    }

    fn info(&self) -> RunnerInfo {
        RunnerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            vm_id: self.vm_id.clone(),
            ip_address: self.ip_address,
            started_at: self.started_at,
            provider_runner_id: self.provider_runner_id,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    runners: HashMap<RunnerId, RunnerRecord>,
    active: bool,
}

impl PoolState {
    fn counts(&self) -> RunnerCounts {
        RunnerCounts::tally(self.runners.values().map(|r| r.status))
    }
}

struct PoolInner<P, V> {
    config: PoolConfig,
    kernel_path: PathBuf,
    settings: PoolSettings,
    provider: P,
    vms: V,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<PoolState>,
    signal: Notify,
    busy_check_running: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// One pool of ephemeral runners.
pub struct Pool<P, V> {
    inner: Arc<PoolInner<P, V>>,
}

impl<P, V> Pool<P, V>
where
    P: RunnerProvider + 'static,
    V: VmLifecycle + 'static,
{
    /// Build a pool. Its lifetime token is a child of `shutdown`.
    ///
    /// # Errors
    /// Returns [`ServerError::InvalidRequest`] if the pool has no kernel path.
    pub fn new(
        config: PoolConfig,
        provider: P,
        vms: V,
        metrics: Arc<dyn MetricsSink>,
        settings: PoolSettings,
        shutdown: &CancellationToken,
    ) -> Result<Self, ServerError> {
        let kernel_path = config.firecracker.kernel_path.clone().ok_or_else(|| {
            ServerError::InvalidRequest(format!("pool {}: no kernel path configured", config.name))
        })?;

        metrics.pool_limits(&config.name, config.min_runners, config.max_runners);
        metrics.pool_active(&config.name, true);
        metrics.runner_counts(&config.name, &RunnerCounts::default());

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                kernel_path,
                settings,
                provider,
                vms,
                metrics,
                state: Mutex::new(PoolState { runners: HashMap::new(), active: true }),
                signal: Notify::new(),
                busy_check_running: AtomicBool::new(false),
                cancel: shutdown.child_token(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Run one reconciliation pass now.
    pub async fn reconcile(&self) {
        self.inner.reconcile().await;
    }
}

#[async_trait]
impl<P, V> ManagedPool for Pool<P, V>
where
    P: RunnerProvider + 'static,
    V: VmLifecycle + 'static,
{
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    async fn start(&self) {
        tracing::info!(
            pool = %self.inner.config.name,
            min_runners = self.inner.config.min_runners,
            max_runners = self.inner.config.max_runners,
            "starting pool"
        );
        self.inner.reconcile().await;
        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(inner.reconcile_loop());
    }

    async fn stop(&self) {
        self.inner.shutdown().await;
    }

    async fn pause(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.active {
            return;
        }
        state.active = false;
        self.inner.metrics.pool_active(&self.inner.config.name, false);
        tracing::info!(pool = %self.inner.config.name, "pool paused");
    }

    async fn resume(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.active {
                return;
            }
            state.active = true;
        }
        self.inner.metrics.pool_active(&self.inner.config.name, true);
        tracing::info!(pool = %self.inner.config.name, "pool resumed");
        self.inner.signal.notify_one();
    }

    async fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock().await;
        let mut runners: Vec<RunnerInfo> = state.runners.values().map(RunnerRecord::info).collect();
        runners.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        PoolStatus {
            name: self.inner.config.name.clone(),
            min_runners: self.inner.config.min_runners,
            max_runners: self.inner.config.max_runners,
            active: state.active,
            counts: state.counts(),
            runners,
        }
    }
}

impl<P, V> PoolInner<P, V>
where
    P: RunnerProvider + 'static,
    V: VmLifecycle + 'static,
{
    fn pool(&self) -> &str {
        &self.config.name
    }

    async fn reconcile_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; start() already ran a pass.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.signal.notified() => {
                    tracing::debug!(pool = %self.pool(), "reconciliation triggered by runner completion");
                }
            }
            self.reconcile().await;
        }
        tracing::debug!(pool = %self.pool(), "reconciliation loop stopped");
    }

    async fn reconcile(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let mut state = self.state.lock().await;
        if !state.active {
            self.metrics.runner_counts(self.pool(), &state.counts());
            tracing::debug!(pool = %self.pool(), "pool is paused, skipping scaling");
            return;
        }

        let counts = state.counts();
        let target = self.config.min_runners.min(self.config.max_runners);
        let deficit = target.saturating_sub(counts.active());

        tracing::debug!(
            pool = %self.pool(),
            active = counts.active(),
            idle = counts.idle,
            busy = counts.busy,
            stopped = counts.terminal(),
            target,
            "pool scaling check"
        );

        if deficit > 0 && counts.terminal() > 0 {
            tracing::info!(
                pool = %self.pool(),
                stopped_runners = counts.terminal(),
                spawning = deficit,
                "spawning replacement runners for completed ephemeral runners"
            );
        }
        for _ in 0..deficit {
            let id = RunnerId::generate(self.pool());
            let name = runner_name(self.pool());
            tracing::info!(pool = %self.pool(), runner_id = %id, "spawning runner");
            self.metrics.scale_requested(self.pool());
            state.runners.insert(id.clone(), RunnerRecord::new(id.clone(), name.clone()));
            self.tasks.spawn(Arc::clone(self).spawn_runner(id, name));
        }

        state.runners.retain(|id, r| {
            if r.status.is_terminal() {
                tracing::debug!(runner_id = %id, status = %r.status, "removing completed runner from pool tracking");
                false
            } else {
                true
            }
        });
        self.metrics.runner_counts(self.pool(), &state.counts());

        let candidates: Vec<(RunnerId, u64)> = state
            .runners
            .values()
            .filter(|r| r.status == RunnerState::Idle)
            .filter_map(|r| r.provider_runner_id.map(|pid| (r.id.clone(), pid)))
            .collect();
        drop(state);

        if !candidates.is_empty() && !self.busy_check_running.swap(true, Ordering::SeqCst) {
            self.tasks.spawn(Arc::clone(self).detect_busy(candidates));
        }
    }

    /// Ask the provider which idle runners picked up a job.
    ///
    /// Runs beside the reconciliation loop so a slow provider never holds up
    /// spawning. At most one check is in flight per pool; checks run
    /// concurrently and are abandoned after `busy_check_timeout`.
    async fn detect_busy(self: Arc<Self>, candidates: Vec<(RunnerId, u64)>) {
        let mut checks = JoinSet::new();
        for (id, provider_id) in candidates {
            let inner = Arc::clone(&self);
            checks.spawn(async move {
                inner.metrics.provider_request(inner.pool(), "runner_jobs");
                let busy = inner.provider.is_runner_busy(provider_id).await;
                (id, provider_id, busy)
            });
        }

        let mut busy = Vec::new();
        let collect = async {
            while let Some(joined) = checks.join_next().await {
                match joined {
                    Ok((id, _, Ok(true))) => busy.push(id),
                    Ok((_, _, Ok(false))) => {}
                    Ok((id, provider_id, Err(e))) => {
                        self.metrics.provider_error(self.pool(), "runner_jobs");
                        tracing::debug!(runner_id = %id, provider_runner_id = provider_id, error = %e, "busy check failed");
                    }
                    Err(e) => tracing::warn!(pool = %self.pool(), error = %e, "busy check task failed"),
                }
            }
        };
        tokio::select! {
            () = self.cancel.cancelled() => {}
            collected = tokio::time::timeout(self.settings.busy_check_timeout, collect) => {
                if collected.is_err() {
                    tracing::debug!(pool = %self.pool(), "busy checks timed out");
                }
            }
        }

        if !busy.is_empty() && !self.cancel.is_cancelled() {
            let mut state = self.state.lock().await;
            for id in &busy {
                if let Some(record) = state.runners.get_mut(id) {
                    if record.status == RunnerState::Idle {
                        tracing::debug!(runner_id = %id, "runner picked up a job");
                        record.status = RunnerState::Busy;
                    }
                }
            }
        }
        self.busy_check_running.store(false, Ordering::SeqCst);
    }

    async fn update(&self, id: &RunnerId, apply: impl FnOnce(&mut RunnerRecord)) {
        if let Some(record) = self.state.lock().await.runners.get_mut(id) {
            apply(record);
        }
    }

    fn runner_metadata(
        &self,
        id: &RunnerId,
        name: &str,
        provider_id: u64,
        token: &RunnerToken,
    ) -> Result<serde_json::Map<String, serde_json::Value>, serde_json::Error> {
        let document = RunnerMetadata {
            instance_url: self.provider.instance_url().to_owned(),
            runner_token: token.expose().to_owned(),
            runner_id: provider_id,
            runner_name: name.to_owned(),
            runner_tags: self.config.runner.tags.join(","),
            pool_name: self.pool().to_owned(),
            vm_id: id.to_string(),
            system_id: system_id(),
        };

        let mut metadata = self.config.firecracker.metadata.clone();
        metadata.insert("instance-id".to_owned(), serde_json::Value::String(id.to_string()));
        metadata.insert("local-hostname".to_owned(), serde_json::Value::String(name.to_owned()));
        metadata.insert(METADATA_NAMESPACE.to_owned(), serde_json::to_value(document)?);
        Ok(metadata)
    }

    async fn spawn_runner(self: Arc<Self>, id: RunnerId, name: String) {
        let start = Instant::now();
        if self.cancel.is_cancelled() {
            self.update(&id, |r| r.status = RunnerState::Failed).await;
            return;
        }

        self.metrics.provider_request(self.pool(), "create_runner");
        let description = format!("firepool runner {name} (pool: {})", self.pool());
        let options = RunnerOptions::from(&self.config.runner);
        let created = match self.provider.create_runner(&description, &self.config.runner.tags, &options).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(pool = %self.pool(), runner_id = %id, error = %e, "failed to create provider runner");
                self.metrics.provider_error(self.pool(), "create_runner");
                self.metrics.scale_failed(self.pool());
                self.update(&id, |r| r.status = RunnerState::Failed).await;
                return;
            }
        };
        let provider_id = created.id;
        tracing::info!(runner_id = %id, provider_runner_id = provider_id, "created provider runner");
        if let Some(expires_at) = created.token_expires_at {
            tracing::debug!(runner_id = %id, token_expires_at = %expires_at, "runner token expires");
        }

        let token = created.token;
        self.update(&id, |r| {
            r.provider_runner_id = Some(provider_id);
            r.token = Some(token.clone());
        })
        .await;

        let vm = match self.runner_metadata(&id, &name, provider_id, &token) {
            Ok(metadata) => {
                let spec = VmSpec::new(id.as_str(), self.pool(), self.kernel_path.clone(), &self.config.runner.image)
                    .with_name(&name)
                    .with_sizing(self.config.firecracker.mem_size_mib, self.config.firecracker.vcpu_count)
                    .with_kernel_args(&self.config.firecracker.kernel_args)
                    .with_labels(self.config.runner.tags.clone())
                    .with_metadata(metadata);
                self.vms.create_vm(&spec).await
            }
            Err(e) => Err(ExecutorError::SpawnFailed(format!("encode guest metadata: {e}"))),
        };
        drop(token);

        let vm = match vm {
            Ok(vm) => vm,
            Err(e) => {
                tracing::error!(pool = %self.pool(), runner_id = %id, error = %e, "failed to create VM for runner");
                self.delete_provider_runner(&id, provider_id).await;
                self.metrics.scale_failed(self.pool());
                self.update(&id, |r| {
                    r.status = RunnerState::Failed;
                    r.deregistered = true;
                    r.token = None;
                })
                .await;
                return;
            }
        };

        self.metrics.vm_created(self.pool(), start.elapsed());
        self.metrics.scale_succeeded(self.pool());
        tracing::info!(
            runner_id = %id,
            vm_id = %vm.id,
            ip = ?vm.ip_address,
            provider_runner_id = provider_id,
            "runner started"
        );

        let vm_id = vm.id.clone();
        self.update(&id, |r| {
            r.status = RunnerState::Idle;
            r.vm_id = Some(vm.id);
            r.ip_address = vm.ip_address;
        })
        .await;

        let monitor = Arc::clone(&self).monitor_runner(id, vm_id, provider_id, start);
        self.tasks.spawn(monitor);
    }

    async fn delete_provider_runner(&self, id: &RunnerId, provider_id: u64) {
        self.metrics.provider_request(self.pool(), "delete_runner");
        if let Err(e) = self.provider.delete_runner(provider_id).await {
            self.metrics.provider_error(self.pool(), "delete_runner");
            tracing::warn!(
                runner_id = %id,
                provider_runner_id = provider_id,
                error = %e,
                "failed to delete provider runner (may already be deleted)"
            );
        }
    }

    async fn destroy_vm(&self, id: &RunnerId, vm_id: &VmId) {
        match tokio::time::timeout(self.settings.destroy_timeout, self.vms.destroy_vm(vm_id)).await {
            Ok(Ok(())) => tracing::debug!(runner_id = %id, vm_id = %vm_id, "VM resources cleaned up"),
            Ok(Err(e)) => tracing::warn!(runner_id = %id, vm_id = %vm_id, error = %e, "failed to clean up VM"),
            Err(_) => tracing::warn!(runner_id = %id, vm_id = %vm_id, "timed out destroying VM"),
        }
    }

    async fn monitor_runner(self: Arc<Self>, id: RunnerId, vm_id: VmId, provider_id: u64, started: Instant) {
        let outcome = self.vms.wait_for_exit(&vm_id, &self.cancel).await;
        let lifetime = started.elapsed();
        let shutting_down = self.cancel.is_cancelled();
        let lifetime_secs = lifetime.as_secs();

        let abnormal = match &outcome {
            _ if shutting_down => {
                tracing::info!(runner_id = %id, vm_id = %vm_id, provider_runner_id = provider_id, lifetime_secs, "runner stopped due to shutdown");
                false
            }
            Ok(()) => {
                tracing::info!(runner_id = %id, vm_id = %vm_id, provider_runner_id = provider_id, lifetime_secs, "runner completed job and exited");
                false
            }
            Err(ExecutorError::AbnormalExit { reason, .. }) => {
                tracing::error!(runner_id = %id, vm_id = %vm_id, provider_runner_id = provider_id, lifetime_secs, reason = %reason, "runner VM exited with error");
                true
            }
            Err(e) => {
                tracing::warn!(runner_id = %id, vm_id = %vm_id, lifetime_secs, error = %e, "lost track of runner VM");
                false
            }
        };
        self.metrics.vm_lifetime(self.pool(), lifetime);

        if !shutting_down {
            self.delete_provider_runner(&id, provider_id).await;
        }

        self.update(&id, |r| {
            r.status = RunnerState::Stopping;
            r.deregistered |= !shutting_down;
            r.token = None;
        })
        .await;

        self.destroy_vm(&id, &vm_id).await;

        let terminal = if abnormal { RunnerState::Failed } else { RunnerState::Stopped };
        self.update(&id, |r| r.status = terminal).await;

        if !shutting_down {
            self.signal.notify_one();
        }
    }

    async fn shutdown(&self) {
        tracing::info!(pool = %self.pool(), "stopping pool");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let mut state = self.state.lock().await;

        let pending: Vec<(RunnerId, String, u64, RunnerState)> = state
            .runners
            .values()
            .filter(|r| !r.deregistered)
            .filter_map(|r| r.provider_runner_id.map(|pid| (r.id.clone(), r.name.clone(), pid, r.status)))
            .collect();
        let deletions = async {
            for (id, name, provider_id, status) in &pending {
                tracing::info!(runner_id = %id, runner_name = %name, provider_runner_id = provider_id, status = %status, "deleting runner from provider");
                self.delete_provider_runner(id, *provider_id).await;
            }
        };
        if tokio::time::timeout(self.settings.shutdown_timeout, deletions).await.is_err() {
            tracing::warn!(pool = %self.pool(), "timed out deleting runners from provider");
        }

        for record in state.runners.values_mut() {
            record.deregistered = true;
            record.token = None;
            if record.status.is_terminal() {
                continue;
            }
            if let Some(vm_id) = &record.vm_id {
                tracing::info!(runner_id = %record.id, vm_id = %vm_id, "stopping runner");
                self.destroy_vm(&record.id, vm_id).await;
            }
            record.status = RunnerState::Stopped;
        }
        self.metrics.runner_counts(self.pool(), &state.counts());
        drop(state);

        if let Err(e) = self.vms.close().await {
            tracing::error!(pool = %self.pool(), error = %e, "failed to close VM manager");
        }
        self.metrics.pool_active(self.pool(), false);
        tracing::info!(pool = %self.pool(), "pool stopped");
    }
}
