//! Multi-pool server: wires configuration to pools and serves the status API.

use std::sync::Arc;

use firepool_core::{Config, MetricsSink};
use firepool_executor::{CniNetwork, CtrEngine, FirecrackerBackend, ManagerConfig, VmManager};
use firepool_provider::GitLabClient;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;
use crate::metrics::PrometheusRecorder;
use crate::pool::{ManagedPool, Pool, PoolSettings};
use crate::routes::{create_router, AppState, PoolRegistry};

type FirecrackerPool = Pool<Arc<GitLabClient>, VmManager<FirecrackerBackend, CtrEngine>>;

/// Every configured pool plus the HTTP status API.
pub struct Server {
    config: Config,
    pools: Arc<PoolRegistry>,
    metrics: Arc<PrometheusRecorder>,
    shutdown: CancellationToken,
}

impl Server {
    /// Build the provider client and one VM manager and pool per configured
    /// pool. Nothing is started yet.
    ///
    /// # Errors
    /// Fails if the provider client cannot be built, a pool directory cannot
    /// be created, or containerd is unreachable.
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        let provider = Arc::new(GitLabClient::new(&config.gitlab)?);
        let metrics = Arc::new(PrometheusRecorder::new());
        let shutdown = CancellationToken::new();
        let mut pools = PoolRegistry::new();

        for pool_config in &config.pools {
            let pool = Self::build_pool(&config, pool_config, &provider, &metrics, &shutdown).await?;
            tracing::info!(
                pool = %pool_config.name,
                image = %pool_config.runner.image,
                min_runners = pool_config.min_runners,
                max_runners = pool_config.max_runners,
                "pool configured"
            );
            pools.insert(pool_config.name.clone(), Arc::new(pool) as Arc<dyn ManagedPool>);
        }

        Ok(Self { config, pools: Arc::new(pools), metrics, shutdown })
    }

    async fn build_pool(
        config: &Config,
        pool_config: &firepool_core::PoolConfig,
        provider: &Arc<GitLabClient>,
        metrics: &Arc<PrometheusRecorder>,
        shutdown: &CancellationToken,
    ) -> Result<FirecrackerPool, ServerError> {
        let sink: Arc<dyn MetricsSink> = Arc::clone(metrics) as Arc<dyn MetricsSink>;

        let binary = pool_config
            .firecracker
            .binary_path
            .clone()
            .or_else(|| config.firecracker.binary_path.clone());
        let network = CniNetwork::new(config.cni.conf_dir.clone(), config.cni.bin_dir.clone(), &config.cni.network_name);
        let backend = FirecrackerBackend::new(binary).with_network(network);
        let engine = CtrEngine::new(
            config.containerd.ctr_binary.clone(),
            config.containerd.address.clone(),
            &config.containerd.snapshotter,
        );
        let manager_config = ManagerConfig::new(config.firecracker.pool_dir.clone());
        let vms = VmManager::new(manager_config, backend, engine, Arc::clone(&sink)).await?;

        let mut pool_config = pool_config.clone();
        pool_config.firecracker.kernel_path = config.kernel_path_for(&pool_config);

        Pool::new(pool_config, Arc::clone(provider), vms, sink, PoolSettings::default(), shutdown)
    }

    #[must_use]
    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    #[must_use]
    pub fn router(&self) -> axum::Router {
        create_router(AppState::new(Arc::clone(&self.pools), Arc::clone(&self.metrics)))
    }

    /// Start every pool and serve the API until `cancel` fires, then stop
    /// every pool.
    ///
    /// # Errors
    /// Returns [`ServerError::Io`] if the listener cannot bind or the HTTP
    /// server fails. Pools are stopped in either case.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        for pool in self.pools.values() {
            pool.start().await;
        }

        let served = self.serve(cancel).await;

        tracing::info!("shutting down pools");
        self.shutdown.cancel();
        let mut stops = JoinSet::new();
        for pool in self.pools.values() {
            let pool = Arc::clone(pool);
            stops.spawn(async move { pool.stop().await });
        }
        while let Some(joined) = stops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "pool stop task failed");
            }
        }
        tracing::info!("all pools stopped");

        served
    }

    async fn serve(&self, cancel: CancellationToken) -> Result<(), ServerError> {
        let addr = &self.config.server.address;
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            e
        })?;
        tracing::info!(addr = %addr, "status API listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        Ok(())
    }
}
