//! Route table and handlers for the operational server

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::health::OverallStatus;

use super::AppState;

// ============================================================================
// Response Types
// ============================================================================

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

// ============================================================================
// Routes
// ============================================================================

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness))
        .route("/health", get(health_report))
        .route("/cache/stats", get(cache_stats))
        .route("/groups/stats", get(group_stats))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
    Json(LivenessResponse {
        status: "alive",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// Full health snapshot; 503 while the service is critical
async fn health_report(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.snapshot().await;
    let status = match report.status {
        OverallStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
        OverallStatus::Healthy | OverallStatus::Warning => StatusCode::OK,
    };
    (status, Json(report))
}

async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.cache.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(e.to_string())),
        )
            .into_response(),
    }
}

async fn group_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.groups.statistics() {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(e.to_string())),
        )
            .into_response(),
    }
}

/// Prometheus text exposition
async fn metrics() -> impl IntoResponse {
    match crate::metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Tests
// ============================================================================
