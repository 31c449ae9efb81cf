//! Operational HTTP server
//!
//! Exposes liveness, the health snapshot, cache and group statistics and the
//! Prometheus registry. It carries no scheduling logic of its own.
//!
//! | Route           | Body                                  |
//! |-----------------|---------------------------------------|
//! | `/health/live`  | `{"status":"alive", ...}`             |
//! | `/health`       | [`HealthReport`](crate::health::HealthReport), 503 when critical |
//! | `/cache/stats`  | [`CacheStats`](crate::cache::CacheStats) |
//! | `/groups/stats` | [`GroupStatistics`](crate::groups::GroupStatistics) |
//! | `/metrics`      | Prometheus text format                |

pub mod api;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cache::PrayerTimeCache;
use crate::config::ServerConfig;
use crate::groups::ActiveGroupsManager;
use crate::health::HealthMonitor;

pub use api::create_router;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health: Arc<HealthMonitor>,
    pub cache: Arc<PrayerTimeCache>,
    pub groups: ActiveGroupsManager,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        health: Arc<HealthMonitor>,
        cache: Arc<PrayerTimeCache>,
        groups: ActiveGroupsManager,
    ) -> Self {
        Self {
            health,
            cache,
            groups,
            start_time: Instant::now(),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct OpsServer {
    bind_address: SocketAddr,
    state: AppState,
}

impl OpsServer {
    pub fn new(config: &ServerConfig, state: AppState) -> Result<Self, ServerError> {
        let bind_address = config
            .bind
            .parse::<SocketAddr>()
            .map_err(|e| ServerError::ConfigError(format!("invalid bind address {}: {e}", config.bind)))?;

        Ok(Self {
            bind_address,
            state,
        })
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Build the router with all routes and layers
    pub fn build_router(&self) -> Router {
        create_router(self.state.clone())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown_signal` resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.bind_address)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        tracing::info!(addr = %self.bind_address, "Operational server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()))?;

        tracing::info!("Operational server shutdown complete");
        Ok(())
    }
}

// ============================================================================
// Server Errors
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to bind: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    ServeError(String),
}
