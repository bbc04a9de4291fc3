//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `IngestionScheduler`: polls the upstream and fills the cache
//! - `BroadcastEngine`: runs live feeds and delivers updates to clients

/// Per-symbol exponential backoff and timer jitter.
pub mod backoff;

/// Live feeds, fan-out and per-client delivery.
pub mod broadcast;

/// Scheduled upstream polling into the cache.
pub mod ingestion;

pub use broadcast::{BroadcastEngine, ClientConnection, ClientStats, EngineConfig, EngineStats};
pub use ingestion::{IngestionConfig, IngestionScheduler, IngestionStats, PollOutcome};
