//! Symbol Universe Port (Driven Port)
//!
//! Read-only view of which symbols currently have subscribers. The
//! ingestion scheduler polls exactly this set.

use std::collections::HashSet;

use crate::domain::market::Symbol;
use crate::domain::subscription::SubscriptionRegistry;

/// Port exposing the symbols to poll.
#[cfg_attr(test, mockall::automock)]
pub trait SymbolUniverse: Send + Sync {
    /// Union of every subscriber's symbols.
    fn all_symbols(&self) -> HashSet<Symbol>;
}

impl SymbolUniverse for SubscriptionRegistry {
    fn all_symbols(&self) -> HashSet<Symbol> {
        Self::all_symbols(self)
    }
}
