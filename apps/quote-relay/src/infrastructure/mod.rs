//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the HTTP surfaces.

/// In-memory TTL cache.
pub mod cache;

/// Wall-clock time source.
pub mod clock;

/// Configuration from environment variables.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Synthetic upstream market data source.
pub mod upstream;

/// WebSocket transport for live clients.
pub mod ws;
