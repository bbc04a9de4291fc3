//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//! Every option has a default; unparseable values fall back to it.

use std::time::Duration;

use crate::application::services::backoff::BackoffPolicy;
use crate::application::services::broadcast::FeedConfig;
use crate::application::services::{EngineConfig, IngestionConfig};

/// Listener ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// WebSocket port for live clients.
    pub ws_port: u16,
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 3000,
            health_port: 8083,
        }
    }
}

/// Ingestion polling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Shortest pause between polls.
    pub min_interval: Duration,
    /// Longest pause between polls.
    pub max_interval: Duration,
    /// TTL for cached quotes and candle windows.
    pub cache_ttl: Duration,
    /// Candles kept per symbol.
    pub klines_window_size: usize,
    /// First backoff delay.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
            max_interval: Duration::from_millis(3000),
            cache_ttl: Duration::from_secs(60),
            klines_window_size: 500,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
        }
    }
}

/// Live broadcast settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSettings {
    /// Shortest pause between feed ticks.
    pub feed_tick_min: Duration,
    /// Longest pause between feed ticks.
    pub feed_tick_max: Duration,
    /// Throttle for clients that do not ask for one.
    pub default_throttle: Duration,
    /// Per-client queue capacity.
    pub max_client_queue: usize,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            feed_tick_min: Duration::from_millis(500),
            feed_tick_max: Duration::from_millis(1500),
            default_throttle: Duration::ZERO,
            max_client_queue: 100,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayConfig {
    /// Listener ports.
    pub server: ServerSettings,
    /// Ingestion polling.
    pub poll: PollSettings,
    /// Live broadcast.
    pub live: LiveSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the candle window size or
    /// the client queue size is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`Self::from_env`].
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);
        let server_defaults = ServerSettings::default();
        let poll_defaults = PollSettings::default();
        let live_defaults = LiveSettings::default();

        let server = ServerSettings {
            ws_port: env.u16("RELAY_WS_PORT", server_defaults.ws_port),
            health_port: env.u16("RELAY_HEALTH_PORT", server_defaults.health_port),
        };

        let poll = PollSettings {
            min_interval: env.millis("RELAY_POLL_MIN_MS", poll_defaults.min_interval),
            max_interval: env.millis("RELAY_POLL_MAX_MS", poll_defaults.max_interval),
            cache_ttl: env.secs("RELAY_CACHE_TTL_SECS", poll_defaults.cache_ttl),
            klines_window_size: env.usize(
                "RELAY_KLINES_WINDOW_SIZE",
                poll_defaults.klines_window_size,
            ),
            backoff_base: env.millis("RELAY_BACKOFF_BASE_MS", poll_defaults.backoff_base),
            backoff_max: env.millis("RELAY_BACKOFF_MAX_MS", poll_defaults.backoff_max),
        };

        let live = LiveSettings {
            feed_tick_min: env.millis("RELAY_FEED_TICK_MIN_MS", live_defaults.feed_tick_min),
            feed_tick_max: env.millis("RELAY_FEED_TICK_MAX_MS", live_defaults.feed_tick_max),
            default_throttle: env.millis(
                "RELAY_DEFAULT_THROTTLE_MS",
                live_defaults.default_throttle,
            ),
            max_client_queue: env.usize("RELAY_MAX_CLIENT_QUEUE", live_defaults.max_client_queue),
        };

        if poll.klines_window_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_KLINES_WINDOW_SIZE",
                reason: "must be at least 1",
            });
        }
        if live.max_client_queue == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_MAX_CLIENT_QUEUE",
                reason: "must be at least 1",
            });
        }

        Ok(Self { server, poll, live })
    }

    /// Settings for the ingestion scheduler.
    #[must_use]
    pub const fn ingestion(&self) -> IngestionConfig {
        IngestionConfig {
            min_interval: self.poll.min_interval,
            max_interval: self.poll.max_interval,
            cache_ttl: self.poll.cache_ttl,
            klines_window_size: self.poll.klines_window_size,
            backoff: BackoffPolicy::new(self.poll.backoff_base, self.poll.backoff_max),
        }
    }

    /// Settings for the broadcast engine.
    #[must_use]
    pub const fn engine(&self) -> EngineConfig {
        EngineConfig {
            feed: FeedConfig {
                tick_min: self.live.feed_tick_min,
                tick_max: self.live.feed_tick_max,
            },
            default_throttle: self.live.default_throttle,
            max_client_queue: self.live.max_client_queue,
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A value parsed but is not allowed.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Environment variable.
        key: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        (self.0)(key).and_then(|v| v.trim().parse().ok())
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parse(key).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parse(key).unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key).map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key).map_or(default, Duration::from_millis)
    }
}
