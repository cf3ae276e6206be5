use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;

use crate::db::{self, pool::PoolStats};
use crate::AppState;

/// Root endpoint - basic status
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "XtreamHub Server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "runtime": "rust"
    }))
}

/// In-process cache stats
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheStats {
    upstream_clients: usize,
    user_catalogs: usize,
    unleased_streams: usize,
}

/// Health check response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    uptime: u64,
    postgres: bool,
    pool: PoolStats,
    default_credential: bool,
    probe: bool,
    cache: CacheStats,
}

/// GET /health - Advanced health check
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    let postgres_ok = db::health_check(&state.pool).await;

    let health = HealthResponse {
        // PostgreSQL is critical for every operation
        status: if postgres_ok { "ok" } else { "unhealthy" }.to_string(),
        uptime,
        postgres: postgres_ok,
        pool: db::pool_stats(&state.pool),
        default_credential: state.credentials.default_client().is_some(),
        probe: state.playback.has_prober(),
        cache: CacheStats {
            upstream_clients: state.credentials.len(),
            user_catalogs: state.credentials.user_catalogs().len().await,
            unleased_streams: state.streaming.ticket_count(),
        },
    };

    Json(health)
}

/// GET /metrics - Prometheus metrics
pub async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                b"Internal Server Error".to_vec(),
            )
        }
    }
}

/// Readiness probe (for Kubernetes)
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if db::health_check(&state.pool).await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready - postgres unavailable")
    }
}

/// Liveness probe (for Kubernetes)
pub async fn live() -> impl IntoResponse {
    (StatusCode::OK, "alive")
}
