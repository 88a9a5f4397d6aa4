//! VmManager lifecycle tests against in-memory backend and image engine
//! doubles. No KVM or containerd required.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use firepool_core::{NoopMetrics, VmId};
use firepool_executor::{
    ExecutorError, ExitSignal, ExitState, ExitWatch, Image, ImageEngine, LaunchRequest, Lease, Machine,
    ManagerConfig, Mount, VmLifecycle, VmManager, VmSpec, VmmBackend,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct EngineState {
    images: Mutex<HashSet<String>>,
    snapshots: Mutex<HashSet<String>>,
    leases: Mutex<HashSet<String>>,
    pulls: AtomicUsize,
    unpacks: AtomicUsize,
    fail_prepare: bool,
    unreachable: bool,
}

#[derive(Clone, Default)]
struct FakeEngine(Arc<EngineState>);

impl FakeEngine {
    fn with(state: EngineState) -> Self {
        Self(Arc::new(state))
    }

    fn live_leases(&self) -> HashSet<String> {
        self.0.leases.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ImageEngine for FakeEngine {
    async fn health_check(&self) -> Result<(), ExecutorError> {
        if self.0.unreachable {
            return Err(ExecutorError::EngineUnavailable("connection refused".to_owned()));
        }
        Ok(())
    }

    async fn get_image(&self, namespace: &str, reference: &str) -> Result<Option<Image>, ExecutorError> {
        let key = format!("{namespace}/{reference}");
        Ok(self.0.images.lock().expect("lock").contains(&key).then(|| Image {
            name: reference.to_owned(),
            digest: "sha256:index".to_owned(),
        }))
    }

    async fn pull(&self, namespace: &str, reference: &str) -> Result<Image, ExecutorError> {
        self.0.pulls.fetch_add(1, Ordering::SeqCst);
        self.0.images.lock().expect("lock").insert(format!("{namespace}/{reference}"));
        Ok(Image { name: reference.to_owned(), digest: "sha256:index".to_owned() })
    }

    async fn unpack(&self, _namespace: &str, _image: &Image) -> Result<(), ExecutorError> {
        self.0.unpacks.fetch_add(1, Ordering::SeqCst);
        self.0.snapshots.lock().expect("lock").insert("sha256:chain".to_owned());
        Ok(())
    }

    async fn rootfs_chain_id(&self, _namespace: &str, _image: &Image) -> Result<String, ExecutorError> {
        Ok("sha256:chain".to_owned())
    }

    async fn create_lease(&self, namespace: &str, id: &str) -> Result<Lease, ExecutorError> {
        self.0.leases.lock().expect("lock").insert(id.to_owned());
        Ok(Lease { id: id.to_owned(), namespace: namespace.to_owned() })
    }

    async fn cancel_lease(&self, lease: &Lease) -> Result<(), ExecutorError> {
        if self.0.leases.lock().expect("lock").remove(&lease.id) {
            Ok(())
        } else {
            Err(ExecutorError::LeaseNotFound(lease.id.clone()))
        }
    }

    async fn list_leases(&self, namespace: &str, prefix: &str) -> Result<Vec<Lease>, ExecutorError> {
        let leases = self.0.leases.lock().expect("lock");
        Ok(leases
            .iter()
            .filter(|id| id.starts_with(prefix))
            .map(|id| Lease { id: id.clone(), namespace: namespace.to_owned() })
            .collect())
    }

    async fn remove_snapshot(&self, _namespace: &str, key: &str) -> Result<(), ExecutorError> {
        self.0.snapshots.lock().expect("lock").remove(key);
        Ok(())
    }

    async fn snapshot_exists(&self, _namespace: &str, key: &str) -> Result<bool, ExecutorError> {
        Ok(self.0.snapshots.lock().expect("lock").contains(key))
    }

    async fn prepare_snapshot(&self, _lease: &Lease, key: &str, _parent: &str) -> Result<(), ExecutorError> {
        if self.0.fail_prepare {
            return Err(ExecutorError::Engine { operation: "snapshots prepare", reason: "pool full".to_owned() });
        }
        self.0.snapshots.lock().expect("lock").insert(key.to_owned());
        Ok(())
    }

    async fn snapshot_mounts(&self, _namespace: &str, key: &str) -> Result<Vec<Mount>, ExecutorError> {
        Ok(vec![Mount {
            kind: "ext4".to_owned(),
            source: format!("/dev/mapper/snap-{key}"),
            options: vec![],
        }])
    }
}

#[derive(Default)]
struct BackendState {
    signals: Mutex<HashMap<String, Arc<ExitSignal>>>,
    metadata: Mutex<Vec<Option<serde_json::Value>>>,
    rootfs: Mutex<Vec<PathBuf>>,
    launches: AtomicUsize,
    stops: AtomicUsize,
    kills: AtomicUsize,
    teardowns: AtomicUsize,
    fail_launch: bool,
    /// The hypervisor ignores graceful stops.
    stubborn: bool,
}

#[derive(Clone, Default)]
struct FakeBackend(Arc<BackendState>);

impl FakeBackend {
    fn with(state: BackendState) -> Self {
        Self(Arc::new(state))
    }

    /// Simulate the hypervisor exiting on its own.
    fn exit(&self, vm_id: &VmId, state: ExitState) {
        if let Some(signal) = self.0.signals.lock().expect("lock").get(vm_id.as_str()) {
            signal.exit(state);
        }
    }
}

#[async_trait]
impl VmmBackend for FakeBackend {
    async fn launch(&self, request: LaunchRequest) -> Result<Machine, ExecutorError> {
        self.0.launches.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_launch {
            return Err(ExecutorError::SpawnFailed("no kvm".to_owned()));
        }
        std::fs::write(&request.socket_path, b"")?;
        self.0.metadata.lock().expect("lock").push(request.metadata.clone());
        self.0.rootfs.lock().expect("lock").push(request.rootfs_path.clone());
        let (signal, watch) = ExitWatch::pair();
        let signal = Arc::new(signal);
        self.0.signals.lock().expect("lock").insert(request.vm_id.to_string(), Arc::clone(&signal));
        let state = Arc::clone(&self.0);
        tokio::spawn(async move {
            signal.kill_requested().await;
            state.kills.fetch_add(1, Ordering::SeqCst);
            signal.exit(ExitState::Failed("signal: 9 (SIGKILL)".to_owned()));
        });
        Ok(Machine::new(request.socket_path, watch).with_ip(IpAddr::V4(Ipv4Addr::new(10, 168, 0, 5))))
    }

    async fn stop(&self, vm_id: &VmId, _machine: &Machine) -> Result<(), ExecutorError> {
        self.0.stops.fetch_add(1, Ordering::SeqCst);
        if !self.0.stubborn {
            self.exit(vm_id, ExitState::Failed("signal: 15 (SIGTERM)".to_owned()));
        }
        Ok(())
    }

    async fn teardown(&self, _vm_id: &VmId, _machine: &Machine) -> Result<(), ExecutorError> {
        self.0.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

struct Fixture {
    _root: tempfile::TempDir,
    manager: VmManager<FakeBackend, FakeEngine>,
    backend: FakeBackend,
    engine: FakeEngine,
}

async fn fixture(backend: FakeBackend, engine: FakeEngine) -> Fixture {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = ManagerConfig::new(root.path().join("pools"));
    config.stop_grace = Duration::from_millis(200);
    let manager = VmManager::new(config, backend.clone(), engine.clone(), Arc::new(NoopMetrics))
        .await
        .expect("manager constructs");
    Fixture { _root: root, manager, backend, engine }
}

fn spec(id: &str) -> VmSpec {
    VmSpec::new(id, "default", PathBuf::from("/var/lib/firepool/vmlinux"), "registry.example.com/runner:latest")
}

#[tokio::test]
async fn create_registers_vm_under_derived_id() {
    let f = fixture(FakeBackend::default(), FakeEngine::default()).await;

    let info = f.manager.create_vm(&spec("default-r1")).await.expect("create");
    assert!(info.id.as_str().starts_with("default-r1-"), "got {}", info.id);
    assert_eq!(info.pool, "default");
    assert_eq!(info.ip_address, Some(IpAddr::V4(Ipv4Addr::new(10, 168, 0, 5))));
    assert!(info.socket_path.ends_with(format!("default/{}.sock", info.id)));
    assert!(info.log_path.exists(), "log file is created");

    assert_eq!(f.manager.get_vm(&info.id).await, Some(info.clone()));
    assert_eq!(f.manager.list_vms().await.len(), 1);

    let leases = f.engine.live_leases();
    assert_eq!(leases.len(), 1);
    assert!(leases.contains(&format!("firepool/pools/default/{}", info.id)));

    let rootfs = f.backend.0.rootfs.lock().expect("lock").clone();
    assert_eq!(rootfs, vec![PathBuf::from(format!("/dev/mapper/snap-{}", info.id))]);
}

#[tokio::test]
async fn image_is_pulled_and_unpacked_once() {
    let f = fixture(FakeBackend::default(), FakeEngine::default()).await;
    f.manager.create_vm(&spec("a")).await.expect("first create");
    f.manager.create_vm(&spec("b")).await.expect("second create");
    assert_eq!(f.engine.0.pulls.load(Ordering::SeqCst), 1);
    assert_eq!(f.engine.0.unpacks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn same_logical_id_gets_distinct_vms() {
    let f = fixture(FakeBackend::default(), FakeEngine::default()).await;
    let a = f.manager.create_vm(&spec("r")).await.expect("create");
    let b = f.manager.create_vm(&spec("r")).await.expect("create");
    assert_ne!(a.id, b.id);
    assert_eq!(f.manager.list_vms().await.len(), 2);
}

#[tokio::test]
async fn destroy_is_idempotent_and_releases_everything() {
    let f = fixture(FakeBackend::default(), FakeEngine::default()).await;
    let info = f.manager.create_vm(&spec("r1")).await.expect("create");
    assert!(info.socket_path.exists());

    f.manager.destroy_vm(&info.id).await.expect("first destroy");
    f.manager.destroy_vm(&info.id).await.expect("second destroy");
    f.manager.destroy_vm(&VmId::from("never-existed")).await.expect("unknown destroy");

    assert_eq!(f.manager.get_vm(&info.id).await, None);
    assert!(f.engine.live_leases().is_empty(), "lease released");
    assert!(!info.socket_path.exists(), "socket removed");
    assert_eq!(f.backend.0.stops.load(Ordering::SeqCst), 1);
    assert_eq!(f.backend.0.kills.load(Ordering::SeqCst), 0, "graceful stop was enough");
    assert_eq!(f.backend.0.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hypervisor_ignoring_stop_is_killed_after_grace() {
    let backend = FakeBackend::with(BackendState { stubborn: true, ..BackendState::default() });
    let f = fixture(backend, FakeEngine::default()).await;
    let info = f.manager.create_vm(&spec("r1")).await.expect("create");

    let started = std::time::Instant::now();
    f.manager.destroy_vm(&info.id).await.expect("destroy");

    assert!(started.elapsed() >= Duration::from_millis(200), "waited out the grace period first");
    assert_eq!(f.backend.0.stops.load(Ordering::SeqCst), 1);
    assert_eq!(f.backend.0.kills.load(Ordering::SeqCst), 1);
    assert_eq!(f.backend.0.teardowns.load(Ordering::SeqCst), 1);
    assert!(f.engine.live_leases().is_empty());
}

#[tokio::test]
async fn launch_failure_releases_lease() {
    let backend = FakeBackend::with(BackendState { fail_launch: true, ..BackendState::default() });
    let f = fixture(backend, FakeEngine::default()).await;

    let result = f.manager.create_vm(&spec("r1")).await;
    assert!(matches!(result, Err(ExecutorError::SpawnFailed(_))), "got {result:?}");
    assert!(f.engine.live_leases().is_empty(), "no leaked lease");
    assert!(f.manager.list_vms().await.is_empty());
}

#[tokio::test]
async fn snapshot_failure_releases_lease_without_launching() {
    let engine = FakeEngine::with(EngineState { fail_prepare: true, ..EngineState::default() });
    let f = fixture(FakeBackend::default(), engine).await;

    let result = f.manager.create_vm(&spec("r1")).await;
    assert!(matches!(result, Err(ExecutorError::Engine { .. })), "got {result:?}");
    assert!(f.engine.live_leases().is_empty());
    assert_eq!(f.backend.0.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn wait_for_exit_distinguishes_outcomes() {
    let f = fixture(FakeBackend::default(), FakeEngine::default()).await;
    let never = CancellationToken::new();

    let clean = f.manager.create_vm(&spec("clean")).await.expect("create");
    f.backend.exit(&clean.id, ExitState::Clean);
    assert!(f.manager.wait_for_exit(&clean.id, &never).await.is_ok());

    let crashed = f.manager.create_vm(&spec("crash")).await.expect("create");
    f.backend.exit(&crashed.id, ExitState::Failed("exit status: 1".to_owned()));
    assert!(matches!(
        f.manager.wait_for_exit(&crashed.id, &never).await,
        Err(ExecutorError::AbnormalExit { .. })
    ));

    let running = f.manager.create_vm(&spec("running")).await.expect("create");
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        f.manager.wait_for_exit(&running.id, &cancel).await,
        Err(ExecutorError::Cancelled(_))
    ));

    assert!(matches!(
        f.manager.wait_for_exit(&VmId::from("unknown"), &never).await,
        Err(ExecutorError::VmNotFound(_))
    ));
}

#[tokio::test]
async fn wait_for_exit_returns_when_vm_exits_later() {
    let f = fixture(FakeBackend::default(), FakeEngine::default()).await;
    let info = f.manager.create_vm(&spec("later")).await.expect("create");

    let backend = f.backend.clone();
    let id = info.id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.exit(&id, ExitState::Clean);
    });

    let waited = tokio::time::timeout(
        Duration::from_secs(5),
        f.manager.wait_for_exit(&info.id, &CancellationToken::new()),
    )
    .await;
    assert!(matches!(waited, Ok(Ok(()))), "got {waited:?}");
}

#[tokio::test]
async fn metadata_is_wrapped_into_versioned_document() {
    let f = fixture(FakeBackend::default(), FakeEngine::default()).await;
    let mut metadata = serde_json::Map::new();
    metadata.insert("instance-id".to_owned(), serde_json::json!("r1"));
    f.manager
        .create_vm(&spec("r1").with_metadata(metadata))
        .await
        .expect("create");
    f.manager.create_vm(&spec("r2")).await.expect("create");

    let docs = f.backend.0.metadata.lock().expect("lock").clone();
    let first = docs[0].as_ref().expect("document for VM with metadata");
    assert_eq!(first["latest"]["meta-data"]["instance-id"], "r1");
    assert_eq!(first["latest"], first["2009-04-04"]);
    assert!(docs[1].is_none(), "no document without metadata");
}

#[tokio::test]
async fn unreachable_engine_fails_construction() {
    let root = tempfile::tempdir().expect("tempdir");
    let engine = FakeEngine::with(EngineState { unreachable: true, ..EngineState::default() });
    let result = VmManager::new(
        ManagerConfig::new(root.path().join("pools")),
        FakeBackend::default(),
        engine,
        Arc::new(NoopMetrics),
    )
    .await;
    assert!(matches!(result, Err(ExecutorError::EngineUnavailable(_))));
}

#[tokio::test]
async fn closed_manager_rejects_new_vms() {
    let f = fixture(FakeBackend::default(), FakeEngine::default()).await;
    f.manager.close().await.expect("close");
    f.manager.close().await.expect("second close is a no-op");
    assert!(matches!(f.manager.create_vm(&spec("r1")).await, Err(ExecutorError::Closed)));
}

#[tokio::test]
async fn startup_releases_leases_of_dead_vms_only() {
    let root = tempfile::tempdir().expect("tempdir");
    let pools = root.path().join("pools");
    let pool_dir = pools.join("default");
    std::fs::create_dir_all(&pool_dir).expect("pool dir");
    // A hypervisor from the earlier process that is still running.
    let _live = tokio::net::UnixListener::bind(pool_dir.join("default-r2-live.sock")).expect("bind");

    let engine = FakeEngine::with(EngineState {
        leases: Mutex::new(HashSet::from([
            "firepool/pools/default/default-r1-dead".to_owned(),
            "firepool/pools/default/default-r2-live".to_owned(),
            "buildkit/unrelated".to_owned(),
        ])),
        snapshots: Mutex::new(HashSet::from(["default-r1-dead".to_owned(), "default-r2-live".to_owned()])),
        ..EngineState::default()
    });
    let manager = VmManager::new(ManagerConfig::new(pools), FakeBackend::default(), engine.clone(), Arc::new(NoopMetrics))
        .await
        .expect("manager constructs");

    assert_eq!(manager.recovery_report().released_leases, vec!["firepool/pools/default/default-r1-dead".to_owned()]);
    assert_eq!(
        engine.live_leases(),
        HashSet::from(["firepool/pools/default/default-r2-live".to_owned(), "buildkit/unrelated".to_owned()])
    );
    let snapshots = engine.0.snapshots.lock().expect("lock").clone();
    assert_eq!(snapshots, HashSet::from(["default-r2-live".to_owned()]));
}
