//! Market Data Types
//!
//! Canonical quote and candle shapes consumed by the ingestion pipeline,
//! and the capped sliding window that candles are merged into.
//!
//! # Candle Window Invariant
//!
//! A window is ascending by timestamp, holds at most one candle per
//! timestamp, and never grows past its cap. A candle whose timestamp equals
//! the last entry's replaces it in place (the bar is still open); any other
//! timestamp is appended, after which the window is deduplicated, sorted and
//! truncated to the most recent `cap` entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Instrument identifier. Opaque and case-sensitive.
pub type Symbol = String;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Latest price snapshot for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Last traded price.
    pub price: f64,
    /// Snapshot time.
    pub timestamp: EpochMillis,
}

/// One OHLC bar. The timestamp is the bar's start and its unique key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Opening price.
    pub open: f64,
    /// Highest price.
    pub high: f64,
    /// Lowest price.
    pub low: f64,
    /// Closing (or latest) price.
    pub close: f64,
    /// Bar start time.
    pub timestamp: EpochMillis,
}

// =============================================================================
// Cache Keys
// =============================================================================

/// Cache key holding the latest [`Quote`] for a symbol.
#[must_use]
pub fn quote_key(symbol: &str) -> String {
    format!("quote:{symbol}")
}

/// Cache key holding the [`CandleWindow`] for a symbol.
#[must_use]
pub fn klines_key(symbol: &str) -> String {
    format!("klines:{symbol}")
}

// =============================================================================
// Candle Window
// =============================================================================

/// Ordered, deduplicated, capped sequence of candles for one symbol.
///
/// Serializes as a plain JSON array so it round-trips through the cache.
///
/// # Example
///
/// ```rust
/// use quote_relay::domain::market::{Candle, CandleWindow};
///
/// let bar = |ts| Candle { open: 1.0, high: 1.0, low: 1.0, close: 1.0, timestamp: ts };
///
/// let mut window = CandleWindow::default();
/// for ts in [100, 200, 200, 150] {
///     window.merge(bar(ts), 10);
/// }
///
/// let stamps: Vec<_> = window.candles().iter().map(|c| c.timestamp).collect();
/// assert_eq!(stamps, vec![100, 150, 200]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandleWindow {
    candles: Vec<Candle>,
}

impl CandleWindow {
    /// Build a window from stored candles, restoring the invariant.
    ///
    /// Later duplicates win, mirroring the merge rule.
    #[must_use]
    pub fn from_candles(candles: Vec<Candle>, cap: usize) -> Self {
        let mut window = Self { candles };
        window.normalize(cap);
        window
    }

    /// Merge a new candle into the window.
    pub fn merge(&mut self, candle: Candle, cap: usize) {
        match self.candles.last_mut() {
            Some(last) if last.timestamp == candle.timestamp => *last = candle,
            _ => self.candles.push(candle),
        }
        self.normalize(cap);
    }

    /// Candles in ascending timestamp order.
    #[must_use]
    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// The most recent candle.
    #[must_use]
    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Number of candles held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    /// Whether the window holds no candles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    fn normalize(&mut self, cap: usize) {
        let by_timestamp: BTreeMap<EpochMillis, Candle> = self
            .candles
            .drain(..)
            .map(|c| (c.timestamp, c))
            .collect();

        let skip = by_timestamp.len().saturating_sub(cap);
        self.candles = by_timestamp.into_values().skip(skip).collect();
    }
}

// =============================================================================
// Tests
// =============================================================================
