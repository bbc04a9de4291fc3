//! Quote Relay Binary
//!
//! Starts the ingestion scheduler, the live broadcast WebSocket server and
//! the health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quote-relay
//! ```
//!
//! # Environment Variables
//!
//! All optional.
//! - `RELAY_WS_PORT`: WebSocket port (default: 3000)
//! - `RELAY_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `RELAY_POLL_MIN_MS` / `RELAY_POLL_MAX_MS`: Poll interval bounds (default: 1000 / 3000)
//! - `RELAY_CACHE_TTL_SECS`: TTL for cached quotes and candles (default: 60)
//! - `RELAY_KLINES_WINDOW_SIZE`: Candles kept per symbol (default: 500)
//! - `RELAY_BACKOFF_BASE_MS` / `RELAY_BACKOFF_MAX_MS`: Backoff bounds (default: 1000 / 30000)
//! - `RELAY_FEED_TICK_MIN_MS` / `RELAY_FEED_TICK_MAX_MS`: Feed tick bounds (default: 500 / 1500)
//! - `RELAY_DEFAULT_THROTTLE_MS`: Per-client throttle (default: 0)
//! - `RELAY_MAX_CLIENT_QUEUE`: Per-client queue capacity (default: 100)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: quote-relay)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use quote_relay::application::ports::{CacheStore, Clock, SymbolUniverse, UpstreamSource};
use quote_relay::infrastructure::cache::InMemoryCache;
use quote_relay::infrastructure::clock::SystemClock;
use quote_relay::infrastructure::telemetry;
use quote_relay::infrastructure::upstream::SyntheticUpstream;
use quote_relay::{
    BroadcastEngine, HealthServer, HealthServerState, IngestionScheduler, RelayConfig,
    SubscriptionRegistry, WsServer, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How often expired cache entries are swept.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Quote Relay");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let cache = Arc::new(InMemoryCache::new());
    cache.spawn_janitor(CACHE_SWEEP_INTERVAL, shutdown_token.clone());
    let cache: Arc<dyn CacheStore> = cache;

    let upstream: Arc<dyn UpstreamSource> = Arc::new(SyntheticUpstream::new(Arc::clone(&clock)));

    let registry = Arc::new(SubscriptionRegistry::new());
    let engine = BroadcastEngine::new(config.engine(), registry, Arc::clone(&clock));
    let universe: Arc<dyn SymbolUniverse> = engine.clone();

    let scheduler = Arc::new(IngestionScheduler::new(
        universe,
        upstream,
        Arc::clone(&cache),
        clock,
        config.ingestion(),
    ));
    scheduler.start();

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&cache),
        Arc::clone(&engine),
        Arc::clone(&scheduler),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn WebSocket server
    let ws_server = WsServer::new(
        config.server.ws_port,
        Arc::clone(&engine),
        shutdown_token.clone(),
    );
    let ws_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
            ws_shutdown.cancel();
        }
    });

    tracing::info!("Quote relay ready");

    await_shutdown(shutdown_token).await;

    scheduler.stop();
    engine.shutdown();

    tracing::info!("Quote relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        ws_port = config.server.ws_port,
        health_port = config.server.health_port,
        poll_min = ?config.poll.min_interval,
        poll_max = ?config.poll.max_interval,
        cache_ttl = ?config.poll.cache_ttl,
        max_client_queue = config.live.max_client_queue,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT), or for a server to give up.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Server stopped unexpectedly, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
