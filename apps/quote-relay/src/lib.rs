#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Quote Relay - Price Ingestion and Live Broadcast
//!
//! Keeps a cache of the latest quote and recent candles for every symbol a
//! client is watching, and pushes a live random-walk price stream with
//! technical indicators to each WebSocket client.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: Core types and pure logic
//!   - `market`: Quotes, candles, cache keys, candle windows
//!   - `indicators`: SMA, EMA, RSI
//!   - `subscription`: Client to symbol registry
//!   - `streaming`: Client protocol messages
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Upstream, cache, clock and symbol universe interfaces
//!   - `services`: Ingestion scheduler, broadcast engine, backoff
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `cache`: In-memory TTL cache
//!   - `upstream`: Synthetic market data source
//!   - `ws`: WebSocket transport
//!   - `config`: Configuration from the environment
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                      ┌──────────────────────┐     quote:<sym>
//! Upstream ◄──poll─────│  IngestionScheduler  │───► klines:<sym> ──► Cache
//!                      └──────────┬───────────┘
//!                                 │ symbol universe
//!                      ┌──────────┴───────────┐
//! feeds ──tick────────►│   BroadcastEngine    │──► Client 1
//!                      │ (registry, throttle, │──► Client 2
//!                      │  bounded queues)     │──► Client N
//!                      └──────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::indicators::{Indicator, IndicatorSet, IndicatorValues};
pub use domain::market::{Candle, CandleWindow, EpochMillis, Quote, Symbol, klines_key, quote_key};
pub use domain::streaming::{ClientMessage, ProtocolError, ServerMessage, UpdateMessage};
pub use domain::subscription::{ClientId, RegistryStats, SubscriptionRegistry};

// Services
pub use application::services::{
    BroadcastEngine, ClientConnection, ClientStats, EngineConfig, EngineStats, IngestionConfig,
    IngestionScheduler, IngestionStats, PollOutcome,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, LiveSettings, PollSettings, RelayConfig, ServerSettings,
};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::ws::{WsServer, WsServerError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
