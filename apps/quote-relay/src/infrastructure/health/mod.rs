//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, relay status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (cache reachable)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::CacheStore;
use crate::application::services::{BroadcastEngine, IngestionScheduler};
use crate::domain::market::EpochMillis;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Cache reachability.
    pub cache: CacheStatus,
    /// Connected live clients.
    pub clients: ClientStatus,
    /// Running symbol feeds.
    pub feeds: FeedStatus,
    /// Subscription statistics.
    pub subscriptions: SubscriptionStatus,
    /// Ingestion scheduler state.
    pub ingestion: IngestionStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Cache reachable and scheduler running.
    Healthy,
    /// One of the two is down.
    Degraded,
    /// Both are down.
    Unhealthy,
}

/// Cache status.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStatus {
    /// Whether the cache answered a ping.
    pub reachable: bool,
}

/// Live client counts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClientStatus {
    /// Connected clients.
    pub connected: usize,
    /// Updates delivered to connected clients.
    pub delivered: u64,
    /// Updates dropped by backpressure for connected clients.
    pub dropped: u64,
}

/// Feed counts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FeedStatus {
    /// Running feeds.
    pub active: usize,
}

/// Subscription statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubscriptionStatus {
    /// Symbols with at least one subscriber.
    pub symbols: usize,
}

/// Ingestion scheduler status.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IngestionStatus {
    /// Whether the poll loop is scheduled.
    pub running: bool,
    /// Completed runs.
    pub runs_completed: u64,
    /// Failed runs.
    pub runs_failed: u64,
    /// Symbols waiting out a backoff.
    pub backed_off_symbols: usize,
    /// Time of the last completed run.
    pub last_success_at: Option<EpochMillis>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    cache: Arc<dyn CacheStore>,
    engine: Arc<BroadcastEngine>,
    scheduler: Arc<IngestionScheduler>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        cache: Arc<dyn CacheStore>,
        engine: Arc<BroadcastEngine>,
        scheduler: Arc<IngestionScheduler>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            cache,
            engine,
            scheduler,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by the health server.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state).await;
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.cache.ping().await {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let cache_reachable = state.cache.ping().await;
    let engine = state.engine.stats();
    let ingestion = state.scheduler.stats();
    let scheduler_running = state.scheduler.is_running();

    HealthResponse {
        status: determine_health_status(cache_reachable, scheduler_running),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        cache: CacheStatus {
            reachable: cache_reachable,
        },
        clients: ClientStatus {
            connected: engine.connected_clients,
            delivered: engine.delivered,
            dropped: engine.dropped,
        },
        feeds: FeedStatus {
            active: engine.active_feeds,
        },
        subscriptions: SubscriptionStatus {
            symbols: engine.subscribed_symbols,
        },
        ingestion: IngestionStatus {
            running: scheduler_running,
            runs_completed: ingestion.runs_completed,
            runs_failed: ingestion.runs_failed,
            backed_off_symbols: ingestion.backed_off_symbols,
            last_success_at: ingestion.last_success_at,
        },
    }
}

const fn determine_health_status(cache_reachable: bool, scheduler_running: bool) -> HealthStatus {
    match (cache_reachable, scheduler_running) {
        (true, true) => HealthStatus::Healthy,
        (true, false) | (false, true) => HealthStatus::Degraded,
        (false, false) => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use test_case::test_case;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{MockCacheStore, MockUpstreamSource};
    use crate::application::services::{EngineConfig, IngestionConfig};
    use crate::domain::subscription::SubscriptionRegistry;
    use crate::infrastructure::clock::SystemClock;

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test_case(true, true, HealthStatus::Healthy ; "all up")]
    #[test_case(true, false, HealthStatus::Degraded ; "scheduler stopped")]
    #[test_case(false, true, HealthStatus::Degraded ; "cache down")]
    #[test_case(false, false, HealthStatus::Unhealthy ; "all down")]
    fn determine_status(cache: bool, scheduler: bool, expected: HealthStatus) {
        assert_eq!(determine_health_status(cache, scheduler), expected);
    }

    fn state(cache_up: bool) -> Arc<HealthServerState> {
        let mut cache = MockCacheStore::new();
        cache.expect_ping().returning(move || cache_up);
        let cache: Arc<dyn CacheStore> = Arc::new(cache);

        let registry = Arc::new(SubscriptionRegistry::new());
        let engine = BroadcastEngine::new(
            EngineConfig::default(),
            Arc::clone(&registry),
            Arc::new(SystemClock),
        );
        let scheduler = Arc::new(IngestionScheduler::new(
            registry,
            Arc::new(MockUpstreamSource::new()),
            Arc::clone(&cache),
            Arc::new(SystemClock),
            IngestionConfig::default(),
        ));

        Arc::new(HealthServerState::new(
            "0.0.0-test".to_string(),
            cache,
            engine,
            scheduler,
        ))
    }

    async fn get(state: Arc<HealthServerState>, uri: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_reports_degraded_when_scheduler_stopped() {
        let (status, body) = get(state(true), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["version"], "0.0.0-test");
        assert_eq!(json["cache"]["reachable"], true);
        assert_eq!(json["ingestion"]["running"], false);
        assert_eq!(json["clients"]["connected"], 0);
    }

    #[tokio::test]
    async fn health_is_unavailable_when_everything_is_down() {
        let (status, _) = get(state(false), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn liveness_and_readiness_routes() {
        assert_eq!(get(state(true), "/healthz").await, (StatusCode::OK, "OK".to_string()));
        assert_eq!(get(state(true), "/readyz").await.0, StatusCode::OK);
        assert_eq!(get(state(false), "/readyz").await.0, StatusCode::SERVICE_UNAVAILABLE);
    }
}
