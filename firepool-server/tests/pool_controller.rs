//! Pool controller scenarios against counting provider and VM doubles.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use firepool_core::{
    MetricsSink, PoolConfig, RunnerConfig, RunnerCounts, RunnerState, RunnerToken, VmId, VmSizing,
};
use firepool_executor::{ExecutorError, VmInfo, VmLifecycle, VmSpec};
use firepool_provider::{CreatedRunner, ProviderError, RunnerOptions, RunnerProvider};
use firepool_server::{ManagedPool, Pool, PoolSettings, ServerError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// ── Doubles ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ProviderState {
    next_id: AtomicU64,
    created: Mutex<Vec<(u64, String)>>,
    deleted: Mutex<Vec<u64>>,
    busy: Mutex<HashSet<u64>>,
    busy_checks: AtomicUsize,
    busy_check_delay_ms: AtomicU64,
    fail_create: AtomicBool,
}

#[derive(Clone, Default)]
struct FakeProvider(Arc<ProviderState>);

impl FakeProvider {
    fn created(&self) -> Vec<(u64, String)> {
        self.0.created.lock().expect("lock").clone()
    }

    fn deleted(&self) -> Vec<u64> {
        self.0.deleted.lock().expect("lock").clone()
    }

    fn set_busy(&self, id: u64) {
        self.0.busy.lock().expect("lock").insert(id);
    }
}

#[async_trait]
impl RunnerProvider for FakeProvider {
    fn instance_url(&self) -> &str {
        "https://gitlab.example.com"
    }

    async fn create_runner(
        &self,
        description: &str,
        _tags: &[String],
        _options: &RunnerOptions,
    ) -> Result<CreatedRunner, ProviderError> {
        if self.0.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::Api {
                operation: "create runner",
                status: 403,
                message: "403 Forbidden".to_owned(),
            });
        }
        let id = 100 + self.0.next_id.fetch_add(1, Ordering::SeqCst);
        self.0.created.lock().expect("lock").push((id, description.to_owned()));
        Ok(CreatedRunner { id, token: RunnerToken::new(format!("glrt-secret-{id}")), token_expires_at: None })
    }

    async fn delete_runner(&self, runner_id: u64) -> Result<(), ProviderError> {
        self.0.deleted.lock().expect("lock").push(runner_id);
        Ok(())
    }

    async fn is_runner_busy(&self, runner_id: u64) -> Result<bool, ProviderError> {
        self.0.busy_checks.fetch_add(1, Ordering::SeqCst);
        let delay = self.0.busy_check_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(self.0.busy.lock().expect("lock").contains(&runner_id))
    }
}

#[derive(Default)]
struct VmState {
    specs: Mutex<Vec<VmSpec>>,
    exits: Mutex<HashMap<VmId, watch::Sender<Option<bool>>>>,
    destroyed: Mutex<Vec<VmId>>,
    fail_create: AtomicBool,
    closed: AtomicBool,
}

#[derive(Clone, Default)]
struct FakeVms(Arc<VmState>);

impl FakeVms {
    fn specs(&self) -> Vec<VmSpec> {
        self.0.specs.lock().expect("lock").clone()
    }

    fn destroyed(&self) -> Vec<VmId> {
        self.0.destroyed.lock().expect("lock").clone()
    }

    fn live(&self) -> Vec<VmId> {
        self.0.exits.lock().expect("lock").keys().cloned().collect()
    }

    /// Make the VM's hypervisor exit, cleanly or not.
    fn exit(&self, id: &VmId, clean: bool) {
        if let Some(tx) = self.0.exits.lock().expect("lock").get(id) {
            tx.send_replace(Some(clean));
        }
    }
}

#[async_trait]
impl VmLifecycle for FakeVms {
    async fn create_vm(&self, spec: &VmSpec) -> Result<VmInfo, ExecutorError> {
        if self.0.fail_create.load(Ordering::SeqCst) {
            return Err(ExecutorError::SpawnFailed("no kvm".to_owned()));
        }
        let mut specs = self.0.specs.lock().expect("lock");
        specs.push(spec.clone());
        let id = VmId::derive(&spec.id);
        let (tx, _rx) = watch::channel(None);
        self.0.exits.lock().expect("lock").insert(id.clone(), tx);
        let octet = u8::try_from(specs.len()).unwrap_or(u8::MAX);
        Ok(VmInfo {
            id,
            name: spec.name.clone(),
            pool: spec.pool.clone(),
            ip_address: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet))),
            socket_path: PathBuf::from("/tmp/fc.sock"),
            log_path: PathBuf::from("/tmp/fc.log"),
            created_at: chrono::Utc::now(),
        })
    }

    async fn destroy_vm(&self, id: &VmId) -> Result<(), ExecutorError> {
        self.0.exits.lock().expect("lock").remove(id);
        self.0.destroyed.lock().expect("lock").push(id.clone());
        Ok(())
    }

    async fn wait_for_exit(&self, id: &VmId, cancel: &CancellationToken) -> Result<(), ExecutorError> {
        let mut rx = self
            .0
            .exits
            .lock()
            .expect("lock")
            .get(id)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| ExecutorError::VmNotFound(id.clone()))?;
        tokio::select! {
            () = cancel.cancelled() => Err(ExecutorError::Cancelled(id.clone())),
            exit = rx.wait_for(Option::is_some) => match exit.map(|v| *v) {
                Ok(Some(true)) => Ok(()),
                _ => Err(ExecutorError::AbnormalExit { vm_id: id.clone(), reason: "exit status 1".to_owned() }),
            },
        }
    }

    async fn get_vm(&self, _id: &VmId) -> Option<VmInfo> {
        None
    }

    async fn list_vms(&self) -> Vec<VmInfo> {
        Vec::new()
    }

    async fn close(&self) -> Result<(), ExecutorError> {
        self.0.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct CountingMetrics {
    passes: AtomicUsize,
    last_counts: Mutex<RunnerCounts>,
    scale_requested: AtomicUsize,
    scale_failed: AtomicUsize,
}

impl CountingMetrics {
    fn passes(&self) -> usize {
        self.passes.load(Ordering::SeqCst)
    }
}

impl MetricsSink for CountingMetrics {
    fn runner_counts(&self, _pool: &str, counts: &RunnerCounts) {
        self.passes.fetch_add(1, Ordering::SeqCst);
        *self.last_counts.lock().expect("lock") = *counts;
    }

    fn scale_requested(&self, _pool: &str) {
        self.scale_requested.fetch_add(1, Ordering::SeqCst);
    }

    fn scale_failed(&self, _pool: &str) {
        self.scale_failed.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    pool: Pool<FakeProvider, FakeVms>,
    provider: FakeProvider,
    vms: FakeVms,
    metrics: Arc<CountingMetrics>,
}

fn pool_config(min_runners: usize, max_runners: usize) -> PoolConfig {
    PoolConfig {
        name: "default".to_owned(),
        min_runners,
        max_runners,
        runner: RunnerConfig {
            tags: vec!["linux".to_owned(), "firecracker".to_owned()],
            run_untagged: false,
            locked: false,
            access_level: "not_protected".to_owned(),
            maximum_timeout: None,
            image: "registry.example.com/ci/runner:latest".to_owned(),
        },
        firecracker: VmSizing { kernel_path: Some(PathBuf::from("/var/lib/firepool/vmlinux")), ..VmSizing::default() },
    }
}

fn settings() -> PoolSettings {
    PoolSettings {
        // Long enough that only the completion signal triggers extra passes.
        reconcile_interval: Duration::from_secs(3600),
        shutdown_timeout: Duration::from_secs(5),
        destroy_timeout: Duration::from_secs(1),
        busy_check_timeout: Duration::from_secs(1),
    }
}

fn harness(min_runners: usize, max_runners: usize) -> Harness {
    let provider = FakeProvider::default();
    let vms = FakeVms::default();
    let metrics = Arc::new(CountingMetrics::default());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let pool = Pool::new(
        pool_config(min_runners, max_runners),
        provider.clone(),
        vms.clone(),
        sink,
        settings(),
        &CancellationToken::new(),
    )
    .expect("pool");
    Harness { pool, provider, vms, metrics }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn counts(pool: &Pool<FakeProvider, FakeVms>) -> RunnerCounts {
    pool.status().await.counts
}

async fn wait_counts(h: &Harness, what: &str, check: impl Fn(&RunnerCounts) -> bool) {
    for _ in 0..500 {
        if check(&counts(&h.pool).await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_idle(h: &Harness, n: usize) {
    wait_counts(h, &format!("{n} idle runners"), |c| c.idle == n).await;
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn cold_start_scales_to_floor() {
    let h = harness(2, 5);
    h.pool.start().await;
    wait_idle(&h, 2).await;

    assert_eq!(h.provider.created().len(), 2);
    assert_eq!(h.vms.specs().len(), 2);
    assert_eq!(h.metrics.scale_requested.load(Ordering::SeqCst), 2);

    let status = h.pool.status().await;
    assert!(status.active);
    assert_eq!(status.counts.active(), 2);
    for runner in &status.runners {
        assert!(runner.vm_id.is_some());
        assert!(runner.ip_address.is_some());
        assert!(runner.provider_runner_id.is_some());
        assert!(runner.name.starts_with("firepool-default-"));
    }

    h.pool.stop().await;
}

#[tokio::test]
async fn runner_description_and_guest_document_carry_identity() {
    let h = harness(1, 1);
    h.pool.start().await;
    wait_idle(&h, 1).await;

    let (provider_id, description) = h.provider.created()[0].clone();
    let runner = h.pool.status().await.runners[0].clone();
    assert_eq!(description, format!("firepool runner {} (pool: default)", runner.name));

    let spec = &h.vms.specs()[0];
    assert_eq!(spec.id, runner.id.as_str());
    assert_eq!(spec.image, "registry.example.com/ci/runner:latest");
    assert_eq!(spec.metadata["instance-id"], runner.id.as_str());
    assert_eq!(spec.metadata["local-hostname"], runner.name.as_str());
    let document = &spec.metadata["firepool"];
    assert_eq!(document["instance_url"], "https://gitlab.example.com");
    assert_eq!(document["runner_token"], format!("glrt-secret-{provider_id}"));
    assert_eq!(document["runner_id"], provider_id);
    assert_eq!(document["runner_tags"], "linux,firecracker");
    assert_eq!(document["pool_name"], "default");

    h.pool.stop().await;
}

#[tokio::test]
async fn token_never_appears_in_status() {
    let h = harness(2, 2);
    h.pool.start().await;
    wait_idle(&h, 2).await;

    let status = h.pool.status().await;
    let json = serde_json::to_string(&status).expect("serialize");
    assert!(!json.contains("glrt-secret"), "token leaked: {json}");
    assert!(!format!("{status:?}").contains("glrt-secret"));

    h.pool.stop().await;
}

#[tokio::test]
async fn completion_revokes_destroys_and_replaces_with_one_extra_pass() {
    let h = harness(1, 1);
    h.pool.start().await;
    wait_idle(&h, 1).await;

    let passes = h.metrics.passes();
    let vm_id = h.vms.live()[0].clone();
    let (provider_id, _) = h.provider.created()[0].clone();
    h.vms.exit(&vm_id, true);

    eventually("provider delete", || h.provider.deleted() == vec![provider_id]).await;
    eventually("vm destroy", || h.vms.destroyed() == vec![vm_id.clone()]).await;
    eventually("replacement spawn", || h.provider.created().len() == 2).await;
    wait_idle(&h, 1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.metrics.passes(), passes + 1, "exactly one signal-triggered pass");

    let status = h.pool.status().await;
    assert_eq!(status.runners.len(), 1, "completed record is purged");
    assert_ne!(status.runners[0].vm_id.as_ref(), Some(&vm_id));

    h.pool.stop().await;
}

#[tokio::test]
async fn abnormal_exit_is_cleaned_up_and_replaced() {
    let h = harness(1, 1);
    h.pool.start().await;
    wait_idle(&h, 1).await;

    let vm_id = h.vms.live()[0].clone();
    h.vms.exit(&vm_id, false);

    eventually("provider delete", || h.provider.deleted().len() == 1).await;
    eventually("vm destroy", || h.vms.destroyed().contains(&vm_id)).await;
    eventually("replacement spawn", || h.provider.created().len() == 2).await;

    h.pool.stop().await;
}

#[tokio::test]
async fn pause_blocks_scaling_and_resume_restores_it() {
    let h = harness(1, 3);
    h.pool.pause().await;
    h.pool.start().await;

    let status = h.pool.status().await;
    assert!(!status.active);
    assert!(status.runners.is_empty());
    assert!(h.provider.created().is_empty());

    h.pool.resume().await;
    wait_idle(&h, 1).await;
    assert!(h.pool.status().await.active);
    assert_eq!(h.provider.created().len(), 1);

    h.pool.stop().await;
}

#[tokio::test]
async fn completion_while_paused_cleans_up_without_replacement() {
    let h = harness(1, 1);
    h.pool.start().await;
    wait_idle(&h, 1).await;

    h.pool.pause().await;
    let vm_id = h.vms.live()[0].clone();
    h.vms.exit(&vm_id, true);

    wait_counts(&h, "stopped record", |c| c.stopped == 1).await;
    assert_eq!(h.vms.destroyed(), vec![vm_id]);
    assert_eq!(h.provider.deleted().len(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.provider.created().len(), 1, "no replacement while paused");

    h.pool.resume().await;
    wait_idle(&h, 1).await;
    assert_eq!(h.provider.created().len(), 2);
    assert_eq!(counts(&h.pool).await.stopped, 0, "resumed pass purges the stopped record");

    h.pool.stop().await;
}

#[tokio::test]
async fn pause_leaves_running_vms_alone() {
    let h = harness(1, 1);
    h.pool.start().await;
    wait_idle(&h, 1).await;

    h.pool.pause().await;
    h.pool.reconcile().await;
    assert_eq!(counts(&h.pool).await.idle, 1);
    assert!(h.vms.destroyed().is_empty());
    assert!(h.provider.deleted().is_empty());

    h.pool.stop().await;
}

#[tokio::test]
async fn busy_runners_are_detected_and_count_toward_floor() {
    let h = harness(1, 2);
    h.pool.start().await;
    wait_idle(&h, 1).await;

    let (provider_id, _) = h.provider.created()[0].clone();
    h.provider.set_busy(provider_id);
    h.pool.reconcile().await;
    wait_counts(&h, "busy runner", |c| c.busy == 1).await;

    let counts = counts(&h.pool).await;
    assert_eq!(counts.idle, 0);
    h.pool.reconcile().await;
    assert_eq!(h.provider.created().len(), 1, "a busy runner satisfies the floor");

    h.pool.stop().await;
}

#[tokio::test]
async fn slow_busy_checks_do_not_delay_replacements() {
    let h = harness(2, 2);
    h.pool.start().await;
    wait_idle(&h, 2).await;

    h.provider.0.busy_check_delay_ms.store(3_000, Ordering::SeqCst);
    let vm_id = h.vms.live()[0].clone();
    let exited = Instant::now();
    h.vms.exit(&vm_id, true);

    eventually("replacement spawn", || h.provider.created().len() == 3).await;
    assert!(exited.elapsed() < Duration::from_secs(1), "replacement waited {:?}", exited.elapsed());
    eventually("busy check of the surviving runner", || h.provider.0.busy_checks.load(Ordering::SeqCst) >= 1)
        .await;

    h.pool.stop().await;
}

#[tokio::test]
async fn shutdown_revokes_busy_runner_and_destroys_its_vm() {
    let h = harness(1, 1);
    h.pool.start().await;
    wait_idle(&h, 1).await;

    let (provider_id, _) = h.provider.created()[0].clone();
    let vm_id = h.vms.live()[0].clone();
    h.provider.set_busy(provider_id);
    h.pool.reconcile().await;
    wait_counts(&h, "busy runner", |c| c.busy == 1).await;

    h.pool.stop().await;

    assert_eq!(h.provider.deleted(), vec![provider_id], "deleted exactly once");
    assert_eq!(h.vms.destroyed(), vec![vm_id]);
    assert!(h.vms.0.closed.load(Ordering::SeqCst));

    let status = h.pool.status().await;
    assert!(status.runners.iter().all(|r| r.status == RunnerState::Stopped));
    assert_eq!(h.metrics.last_counts.lock().expect("lock").stopped, 1);
    assert_eq!(h.provider.created().len(), 1, "no spawns during shutdown");
}

#[tokio::test]
async fn vm_boot_failure_revokes_minted_identity() {
    let h = harness(1, 1);
    h.vms.0.fail_create.store(true, Ordering::SeqCst);
    h.pool.start().await;

    eventually("compensating delete", || h.provider.deleted().len() == 1).await;
    wait_counts(&h, "failed record", |c| c.failed == 1).await;
    let (provider_id, _) = h.provider.created()[0].clone();
    assert_eq!(h.provider.deleted(), vec![provider_id]);

    h.pool.stop().await;
    assert_eq!(h.provider.deleted().len(), 1, "shutdown does not delete twice");
}

#[tokio::test]
async fn provider_failure_marks_runner_failed_without_vm() {
    let h = harness(1, 1);
    h.provider.0.fail_create.store(true, Ordering::SeqCst);
    h.pool.start().await;

    wait_counts(&h, "failed record", |c| c.failed == 1).await;
    assert_eq!(h.metrics.scale_failed.load(Ordering::SeqCst), 1);
    assert!(h.vms.specs().is_empty());
    assert!(h.provider.deleted().is_empty());

    // The next pass purges the failed record and retries.
    h.provider.0.fail_create.store(false, Ordering::SeqCst);
    h.pool.reconcile().await;
    wait_idle(&h, 1).await;

    h.pool.stop().await;
}

#[tokio::test]
async fn missing_kernel_path_is_rejected() {
    let mut config = pool_config(1, 1);
    config.firecracker.kernel_path = None;
    let result = Pool::new(
        config,
        FakeProvider::default(),
        FakeVms::default(),
        Arc::new(firepool_core::NoopMetrics),
        settings(),
        &CancellationToken::new(),
    );
    assert!(matches!(result, Err(ServerError::InvalidRequest(_))));
}
