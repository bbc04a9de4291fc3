//! Upstream Source Port (Driven Port)
//!
//! Interface for fetching the latest quote and candle for a batch of
//! symbols from a price provider.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::domain::market::{Candle, Quote, Symbol};

/// Latest data for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpstreamItem {
    /// Latest quote.
    pub quote: Quote,
    /// Current bar, when the provider has one.
    pub candle: Option<Candle>,
}

/// Result of one batched fetch.
///
/// Symbols in neither `items` nor `failed` simply had no update this round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamBatch {
    /// Symbols that returned data.
    pub items: HashMap<Symbol, UpstreamItem>,
    /// Symbols the provider reported as failed.
    pub failed: HashSet<Symbol>,
}

impl UpstreamBatch {
    /// Mark a symbol as failed.
    #[must_use]
    pub fn with_failed(mut self, symbol: impl Into<Symbol>) -> Self {
        self.failed.insert(symbol.into());
        self
    }
}

impl From<HashMap<Symbol, UpstreamItem>> for UpstreamBatch {
    fn from(items: HashMap<Symbol, UpstreamItem>) -> Self {
        Self {
            items,
            failed: HashSet::new(),
        }
    }
}

/// Wholesale fetch failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Provider could not be reached.
    #[error("upstream connection error: {message}")]
    ConnectionError {
        /// Error details.
        message: String,
    },

    /// Provider answered with something unusable.
    #[error("upstream response error: {message}")]
    InvalidResponse {
        /// Error details.
        message: String,
    },

    /// Provider did not answer in time.
    #[error("upstream request timed out")]
    Timeout,
}

/// Port for batched price fetches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Fetch the latest data for `symbols` in one call.
    async fn fetch(&self, symbols: &[Symbol]) -> Result<UpstreamBatch, UpstreamError>;
}
