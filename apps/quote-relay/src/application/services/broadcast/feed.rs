//! Symbol Feed
//!
//! A self-driving random-walk price generator for one symbol. Each tick
//! nudges the price, appends it to a rolling history and recomputes the
//! indicators from that history.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;

use crate::domain::indicators::{self, IndicatorValues};
use crate::domain::market::{EpochMillis, Symbol};

/// Samples kept for indicator computation.
pub const HISTORY_LEN: usize = 20;

/// Largest absolute price change per tick.
pub const MAX_STEP: f64 = 0.5;

/// Prices never fall below this.
pub const PRICE_FLOOR: f64 = 0.01;

/// Tick spacing for every feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    /// Shortest pause between ticks.
    pub tick_min: Duration,
    /// Longest pause between ticks.
    pub tick_max: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            tick_min: Duration::from_millis(500),
            tick_max: Duration::from_millis(1500),
        }
    }
}

/// A tick that could not be applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    /// The step produced NaN or infinity.
    #[error("feed {symbol} produced non-finite price {price}")]
    NonFinitePrice {
        /// Feed symbol.
        symbol: Symbol,
        /// Offending value.
        price: f64,
    },
}

/// Output of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedTick {
    /// New price.
    pub price: f64,
    /// Tick time.
    pub timestamp: EpochMillis,
    /// Every indicator over the updated history.
    pub indicators: IndicatorValues,
}

/// Random-walk state for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolFeed {
    symbol: Symbol,
    price: f64,
    history: VecDeque<f64>,
}

impl SymbolFeed {
    /// Start a feed at `price`.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Start a feed at a random price in `[50, 150)`.
    #[must_use]
    pub fn with_random_price(symbol: impl Into<Symbol>) -> Self {
        Self::new(symbol, rand::rng().random_range(50.0..150.0))
    }

    /// Apply a random step in `[-MAX_STEP, MAX_STEP]`.
    ///
    /// # Errors
    ///
    /// See [`Self::step`].
    pub fn tick(&mut self, timestamp: EpochMillis) -> Result<FeedTick, FeedError> {
        let delta = rand::rng().random_range(-MAX_STEP..=MAX_STEP);
        self.step(delta, timestamp)
    }

    /// Move the price by `delta`, floored at [`PRICE_FLOOR`].
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::NonFinitePrice`] and leaves the feed unchanged
    /// when the result is not finite.
    pub fn step(&mut self, delta: f64, timestamp: EpochMillis) -> Result<FeedTick, FeedError> {
        let next = self.price + delta;
        if !next.is_finite() {
            return Err(FeedError::NonFinitePrice {
                symbol: self.symbol.clone(),
                price: next,
            });
        }

        self.price = next.max(PRICE_FLOOR);
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(self.price);

        Ok(FeedTick {
            price: self.price,
            timestamp,
            indicators: indicators::compute(self.history.make_contiguous()),
        })
    }

    /// Feed symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Current price.
    #[must_use]
    pub const fn price(&self) -> f64 {
        self.price
    }

    /// Number of samples in the history.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
