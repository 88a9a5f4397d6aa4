//! Axum route handlers for the firepool status API.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use firepool_core::{PoolStatus, RunnerCounts, RunnerInfo};
use indexmap::IndexMap;
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{error::ServerError, metrics::PrometheusRecorder, pool::ManagedPool};

// ── Shared state ─────────────────────────────────────────────────────────────

/// Pools in configuration order, keyed by name.
pub type PoolRegistry = IndexMap<String, Arc<dyn ManagedPool>>;

#[derive(Clone)]
pub struct AppState {
    pools: Arc<PoolRegistry>,
    metrics: Arc<PrometheusRecorder>,
}

impl AppState {
    #[must_use]
    pub fn new(pools: Arc<PoolRegistry>, metrics: Arc<PrometheusRecorder>) -> Self {
        Self { pools, metrics }
    }

    fn pool(&self, name: &str) -> Result<&Arc<dyn ManagedPool>, ServerError> {
        self.pools.get(name).ok_or_else(|| ServerError::PoolNotFound(name.to_owned()))
    }
}

// ── Response types ────────────────────────────────────────────────────────────

/// Pool status without the runner list.
#[derive(Debug, Serialize)]
pub struct PoolSummary {
    pub name: String,
    pub min_runners: usize,
    pub max_runners: usize,
    pub active: bool,
    pub current_runners: usize,
    pub counts: RunnerCounts,
}

impl From<&PoolStatus> for PoolSummary {
    fn from(status: &PoolStatus) -> Self {
        Self {
            name: status.name.clone(),
            min_runners: status.min_runners,
            max_runners: status.max_runners,
            active: status.active,
            current_runners: status.counts.total(),
            counts: status.counts,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PoolDetail {
    #[serde(flatten)]
    pub summary: PoolSummary,
    pub runners: Vec<RunnerInfo>,
}

#[derive(Debug, Serialize)]
pub struct PoolRunner {
    pub pool: String,
    #[serde(flatten)]
    pub runner: RunnerInfo,
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the status API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/api/v1/pools", get(list_pools))
        .route("/api/v1/pools/{name}", get(get_pool))
        .route("/api/v1/pools/{name}/pause", post(pause_pool))
        .route("/api/v1/pools/{name}/resume", post(resume_pool))
        .route("/api/v1/runners", get(list_runners))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health` and `GET /healthz`.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "healthy"})))
}

/// `GET /api/v1/pools`
pub async fn list_pools(State(state): State<AppState>) -> Json<Vec<PoolSummary>> {
    let mut pools = Vec::with_capacity(state.pools.len());
    for pool in state.pools.values() {
        pools.push(PoolSummary::from(&pool.status().await));
    }
    Json(pools)
}

/// `GET /api/v1/pools/{name}`
///
/// # Errors
/// Returns [`ServerError::PoolNotFound`] for unknown names.
pub async fn get_pool(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<PoolDetail>, ServerError> {
    let status = state.pool(&name)?.status().await;
    let summary = PoolSummary::from(&status);
    Ok(Json(PoolDetail { summary, runners: status.runners }))
}

/// `POST /api/v1/pools/{name}/pause`
///
/// # Errors
/// Returns [`ServerError::PoolNotFound`] for unknown names.
pub async fn pause_pool(State(state): State<AppState>, Path(name): Path<String>) -> Result<impl IntoResponse, ServerError> {
    let pool = state.pool(&name)?;
    pool.pause().await;
    Ok(Json(PoolSummary::from(&pool.status().await)))
}

/// `POST /api/v1/pools/{name}/resume`
///
/// # Errors
/// Returns [`ServerError::PoolNotFound`] for unknown names.
pub async fn resume_pool(State(state): State<AppState>, Path(name): Path<String>) -> Result<impl IntoResponse, ServerError> {
    let pool = state.pool(&name)?;
    pool.resume().await;
    Ok(Json(PoolSummary::from(&pool.status().await)))
}

/// `GET /api/v1/runners`
pub async fn list_runners(State(state): State<AppState>) -> Json<Vec<PoolRunner>> {
    let mut runners = Vec::new();
    for pool in state.pools.values() {
        let status = pool.status().await;
        runners.extend(status.runners.into_iter().map(|runner| PoolRunner { pool: status.name.clone(), runner }));
    }
    Json(runners)
}

/// `GET /metrics` in Prometheus text format.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}
