//! Application Ports (Driven)
//!
//! Interfaces the application services use to reach the outside world.
//! Infrastructure adapters implement these; tests substitute mocks.
//!
//! - `UpstreamSource`: batched quote/candle fetch from a price provider
//! - `CacheStore`: key/value store with per-entry TTL
//! - `SymbolUniverse`: the set of symbols someone is currently interested in
//! - `Clock`: wall-clock time in epoch milliseconds

mod cache_port;
mod clock_port;
mod symbol_universe_port;
mod upstream_port;

pub use cache_port::{CacheError, CacheStore, get_json, set_json};
pub use clock_port::Clock;
pub use symbol_universe_port::SymbolUniverse;
pub use upstream_port::{UpstreamBatch, UpstreamError, UpstreamItem, UpstreamSource};

#[cfg(test)]
pub use cache_port::MockCacheStore;
#[cfg(test)]
pub use clock_port::MockClock;
#[cfg(test)]
pub use symbol_universe_port::MockSymbolUniverse;
#[cfg(test)]
pub use upstream_port::MockUpstreamSource;
