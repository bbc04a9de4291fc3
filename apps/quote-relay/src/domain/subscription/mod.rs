//! Subscription Registry
//!
//! Tracks which symbols each connected client is subscribed to, and the
//! reverse index from symbol to subscribed clients.
//!
//! # Design
//!
//! The registry tracks:
//! - Which symbols each client is subscribed to
//! - Which clients subscribe to each symbol (kept in step with the above)
//!
//! The reverse index lets the broadcast engine fan an update out without
//! scanning every client, and tells it when a symbol's last subscriber is
//! gone. `all_symbols()` is the poll universe for the ingestion scheduler.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::domain::market::Symbol;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a connected client.
pub type ClientId = u64;

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    /// Map from client ID to their subscribed symbols.
    client_symbols: HashMap<ClientId, HashSet<Symbol>>,
    /// Map from symbol to the clients subscribed to it.
    symbol_clients: HashMap<Symbol, HashSet<ClientId>>,
}

impl RegistryState {
    /// Returns symbols that gained their first subscriber.
    fn add(&mut self, client: ClientId, symbols: &[Symbol]) -> Vec<Symbol> {
        let client_set = self.client_symbols.entry(client).or_default();
        let mut activated = Vec::new();

        for symbol in symbols {
            if !client_set.insert(symbol.clone()) {
                continue;
            }

            let subscribers = self.symbol_clients.entry(symbol.clone()).or_default();
            subscribers.insert(client);

            if subscribers.len() == 1 {
                activated.push(symbol.clone());
            }
        }

        if client_set.is_empty() {
            self.client_symbols.remove(&client);
        }

        activated
    }

    /// Returns symbols that lost their last subscriber.
    fn remove(&mut self, client: ClientId, symbols: &[Symbol]) -> Vec<Symbol> {
        let Some(client_set) = self.client_symbols.get_mut(&client) else {
            return vec![];
        };

        let mut deactivated = Vec::new();

        for symbol in symbols {
            if !client_set.remove(symbol) {
                continue;
            }

            if Self::detach(&mut self.symbol_clients, symbol, client) {
                deactivated.push(symbol.clone());
            }
        }

        if client_set.is_empty() {
            self.client_symbols.remove(&client);
        }

        deactivated
    }

    fn remove_client(&mut self, client: ClientId) -> Vec<Symbol> {
        let Some(client_set) = self.client_symbols.remove(&client) else {
            return vec![];
        };

        client_set
            .into_iter()
            .filter(|symbol| Self::detach(&mut self.symbol_clients, symbol, client))
            .collect()
    }

    /// Drop `client` from a symbol's subscriber set. True when the set empties.
    fn detach(
        symbol_clients: &mut HashMap<Symbol, HashSet<ClientId>>,
        symbol: &Symbol,
        client: ClientId,
    ) -> bool {
        let Some(subscribers) = symbol_clients.get_mut(symbol) else {
            return false;
        };

        subscribers.remove(&client);
        if subscribers.is_empty() {
            symbol_clients.remove(symbol);
            return true;
        }
        false
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Bidirectional client ↔ symbol membership.
///
/// All operations are total; removing something that is not there is a
/// no-op. A client whose last symbol is removed disappears from the registry.
///
/// # Example
///
/// ```rust
/// use quote_relay::domain::subscription::SubscriptionRegistry;
///
/// let registry = SubscriptionRegistry::new();
///
/// // First subscriber activates the symbol
/// let activated = registry.subscribe(1, &["AAPL".to_string(), "MSFT".to_string()]);
/// assert_eq!(activated.len(), 2);
///
/// // A second subscriber does not
/// let activated = registry.subscribe(2, &["AAPL".to_string()]);
/// assert!(activated.is_empty());
///
/// // Removing the only MSFT subscriber deactivates it
/// let deactivated = registry.unsubscribe(1, Some(&["MSFT".to_string()]));
/// assert_eq!(deactivated, vec!["MSFT".to_string()]);
///
/// assert_eq!(registry.all_symbols().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add symbols to a client's set. Duplicates are no-ops.
    ///
    /// Returns the symbols that had no subscriber before this call.
    pub fn subscribe(&self, client: ClientId, symbols: &[Symbol]) -> Vec<Symbol> {
        self.state.write().add(client, symbols)
    }

    /// Remove the given symbols from a client, or the client entirely when
    /// `symbols` is `None`.
    ///
    /// Returns the symbols left without any subscriber.
    pub fn unsubscribe(&self, client: ClientId, symbols: Option<&[Symbol]>) -> Vec<Symbol> {
        let mut state = self.state.write();
        match symbols {
            Some(symbols) => state.remove(client, symbols),
            None => state.remove_client(client),
        }
    }

    /// Remove a client unconditionally.
    ///
    /// Returns the symbols left without any subscriber.
    pub fn unsubscribe_all(&self, client: ClientId) -> Vec<Symbol> {
        self.state.write().remove_client(client)
    }

    /// Union of every client's symbols.
    #[must_use]
    pub fn all_symbols(&self) -> HashSet<Symbol> {
        self.state.read().symbol_clients.keys().cloned().collect()
    }

    /// Snapshot of one client's symbols (empty for unknown clients).
    #[must_use]
    pub fn client_symbols(&self, client: ClientId) -> HashSet<Symbol> {
        self.state
            .read()
            .client_symbols
            .get(&client)
            .cloned()
            .unwrap_or_default()
    }

    /// Clients currently subscribed to a symbol.
    #[must_use]
    pub fn subscribers(&self, symbol: &str) -> Vec<ClientId> {
        self.state
            .read()
            .symbol_clients
            .get(symbol)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the client holds any subscription.
    #[must_use]
    pub fn contains_client(&self, client: ClientId) -> bool {
        self.state.read().client_symbols.contains_key(&client)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            symbol_count: state.symbol_clients.len(),
            client_count: state.client_symbols.len(),
            subscription_count: state.client_symbols.values().map(HashSet::len).sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of registry size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of distinct subscribed symbols.
    pub symbol_count: usize,
    /// Number of clients holding at least one subscription.
    pub client_count: usize,
    /// Total (client, symbol) pairs.
    pub subscription_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
