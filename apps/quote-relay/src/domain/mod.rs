//! Domain Layer - Core market data types and business rules.
//!
//! This layer contains the core types for ingestion and live streaming
//! with no I/O. Everything here is plain Rust with serialization support.

/// Derived indicators (SMA, EMA, RSI).
pub mod indicators;

/// Quotes, candles and the candle sliding window.
pub mod market;

/// Client streaming protocol messages.
pub mod streaming;

/// Subscription tracking.
pub mod subscription;
