//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the ingestion and broadcast services and the port
//! interfaces they use to reach the upstream, the cache and the clock.

/// Port interfaces for external systems (upstream, cache, clock).
pub mod ports;

/// Ingestion scheduling and live broadcast.
pub mod services;
