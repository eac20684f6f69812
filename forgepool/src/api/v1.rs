//! API endpoints.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::job::manager::JobManager;
use crate::stats::{now_ms, PoolStats, StatsSnapshot};
use crate::stratum::server::{Registry, RegistrySnapshot};

/// Shared application state for API endpoints.
#[derive(Clone)]
pub struct AppState {
    pub stats: Arc<PoolStats>,
    pub manager: Arc<JobManager>,
    pub registry: Arc<Registry>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: StatsSnapshot,
    connections: ConnectionCounts,
}

#[derive(Debug, Serialize)]
struct ConnectionCounts {
    connected: usize,
    subscribed: usize,
    authorized: usize,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    job_id: String,
    height: u64,
    clean_jobs: bool,
    segwit: bool,
    created_at: u64,
    age_sec: u64,
    prevhash_epoch: u64,
    bits: String,
    ntime: String,
    version: String,
    merkle_branches: usize,
    transactions: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    uptime_sec: u64,
    has_job: bool,
    current_height: u64,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let registry = state.registry.snapshot();
    Json(StatsResponse {
        stats: state.stats.snapshot(),
        connections: ConnectionCounts {
            connected: registry.connected,
            subscribed: registry.subscribed,
            authorized: registry.authorized,
        },
    })
}

async fn workers(State(state): State<AppState>) -> Json<RegistrySnapshot> {
    Json(state.registry.snapshot())
}

async fn job(State(state): State<AppState>) -> Json<Option<JobResponse>> {
    Json(state.manager.current_job().map(|job| JobResponse {
        job_id: job.job_id.clone(),
        height: job.height,
        clean_jobs: job.clean_jobs,
        segwit: job.segwit,
        created_at: job.created_at,
        age_sec: now_ms().saturating_sub(job.created_at) / 1000,
        prevhash_epoch: job.prevhash_epoch,
        bits: job.bits_hex.clone(),
        ntime: job.ntime_hex.clone(),
        version: job.version_hex.clone(),
        merkle_branches: job.merkle_branches.len(),
        transactions: job.transactions.len(),
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.stats.snapshot();
    let has_job = state.manager.current_job().is_some();
    Json(HealthResponse {
        ok: has_job,
        uptime_sec: snapshot.uptime_sec,
        has_job,
        current_height: snapshot.current_height,
    })
}

/// Build the API routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(stats))
        .route("/api/workers", get(workers))
        .route("/api/job", get(job))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
