//! Status endpoint
//!
//! A small axum server exposing liveness and the pipeline counters. It has
//! no influence on capture and may be disabled.

use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::StatusConfig;
use crate::error::{Result, TapError};
use crate::pipeline::{CounterSnapshot, Pipeline};

/// Shared state for the status handlers
#[derive(Clone)]
pub struct StatusState {
    pub pipeline: Arc<Pipeline>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub primary_configured: bool,
    pub primary_connected: bool,
    pub degraded: bool,
    pub uptime_secs: i64,
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub counters: CounterSnapshot,
    pub total_faults: u64,
    pub active_connections: usize,
    pub threads: usize,
    pub dedup_entries: usize,
}

pub fn create_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn health_handler(State(state): State<Arc<StatusState>>) -> Json<HealthReport> {
    let adapter = state.pipeline.adapter();
    Json(HealthReport {
        status: "ok",
        primary_configured: adapter.has_primary(),
        primary_connected: adapter.primary_connected(),
        degraded: adapter.is_degraded(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

async fn stats_handler(State(state): State<Arc<StatusState>>) -> Json<StatsReport> {
    let counters = state.pipeline.counters().snapshot();
    let correlator = state.pipeline.correlator();
    Json(StatsReport {
        total_faults: counters.total_faults(),
        counters,
        active_connections: state.pipeline.active_workers(),
        threads: correlator.thread_count(),
        dedup_entries: correlator.dedup().len(),
    })
}

pub async fn bind(config: &StatusConfig) -> Result<TcpListener> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| TapError::Config(format!("Invalid status listen address: {e}")))?;

    TcpListener::bind(addr)
        .await
        .map_err(|e| TapError::Bind(format!("Failed to bind status endpoint to {addr}: {e}")))
}

/// Serve until `shutdown` fires
pub async fn serve(listener: TcpListener, state: StatusState, shutdown: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Status endpoint listening on {addr}");
    }

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| TapError::General(format!("Status server error: {e}")))
}
