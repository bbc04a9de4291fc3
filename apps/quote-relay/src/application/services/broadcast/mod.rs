//! Broadcast Engine
//!
//! Owns the live side of the relay: one [`SymbolFeed`] per subscribed
//! symbol, the subscription registry, and a delivery channel per client.
//!
//! # Architecture
//!
//! ```text
//!  feed task (AAPL) ──tick──┐
//!  feed task (MSFT) ──tick──┼──► BroadcastEngine ──enqueue──► ClientChannel ──► worker ──► outbound
//!  feed task (...)  ──tick──┘         │                      (throttle, bounded queue)
//!                                     └── SubscriptionRegistry (symbol → clients)
//! ```
//!
//! A feed is created on the first subscribe to its symbol and retired when
//! the symbol's last subscriber leaves. Each feed re-arms after every tick
//! with its own jittered delay, so feeds never tick in lockstep.
//!
//! # Locking
//!
//! Engine state is locked before the registry, never the other way round,
//! and no lock is held across an await.

mod client;
pub mod feed;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use client::{ClientStats, EnqueueOutcome};
pub use feed::{FeedConfig, FeedError, FeedTick, SymbolFeed};

use self::client::ClientChannel;
use crate::application::ports::{Clock, SymbolUniverse};
use crate::application::services::backoff::jittered_delay;
use crate::domain::indicators::IndicatorSet;
use crate::domain::market::Symbol;
use crate::domain::streaming::{
    ClientMessage, ProtocolError, ServerMessage, SubscribeRequest, UpdateMessage,
};
use crate::domain::subscription::{ClientId, SubscriptionRegistry};
use crate::infrastructure::metrics;

/// Buffer between a delivery worker and the transport writer.
const OUTBOUND_BUFFER: usize = 1;

// =============================================================================
// Configuration and Stats
// =============================================================================

/// Engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Feed tick spacing.
    pub feed: FeedConfig,
    /// Throttle applied until a client asks for another.
    pub default_throttle: Duration,
    /// Per-client queue capacity.
    pub max_client_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            default_throttle: Duration::ZERO,
            max_client_queue: 100,
        }
    }
}

/// Engine-wide counters. Delivery totals cover connected clients only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Connected clients.
    pub connected_clients: usize,
    /// Running feeds.
    pub active_feeds: usize,
    /// Symbols with at least one subscriber.
    pub subscribed_symbols: usize,
    /// Updates delivered.
    pub delivered: u64,
    /// Updates dropped by backpressure.
    pub dropped: u64,
    /// Feed ticks skipped after an error, across running feeds.
    pub feed_errors: u64,
}

/// A freshly connected client.
#[derive(Debug)]
pub struct ClientConnection {
    /// Identifier for every later call.
    pub id: ClientId,
    /// Live updates for this client, in delivery order.
    pub outbound: mpsc::Receiver<ServerMessage>,
}

// =============================================================================
// Engine
// =============================================================================

struct FeedEntry {
    feed: SymbolFeed,
    errors: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct EngineState {
    clients: HashMap<ClientId, ClientChannel>,
    feeds: HashMap<Symbol, FeedEntry>,
}

/// Fans per-symbol feed ticks out to subscribed clients.
pub struct BroadcastEngine {
    config: EngineConfig,
    registry: Arc<SubscriptionRegistry>,
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
    shutdown: CancellationToken,
    this: Weak<Self>,
}

impl BroadcastEngine {
    /// Create an engine with no clients and no feeds.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        registry: Arc<SubscriptionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            registry,
            clock,
            state: Mutex::new(EngineState::default()),
            shutdown: CancellationToken::new(),
            this: this.clone(),
        })
    }

    /// Register a client and start its delivery worker.
    pub fn connect(&self) -> ClientConnection {
        let (tx, outbound) = mpsc::channel(OUTBOUND_BUFFER);

        let mut state = self.state.lock();
        let mut id = Uuid::new_v4().as_u64_pair().0;
        while state.clients.contains_key(&id) {
            id = Uuid::new_v4().as_u64_pair().0;
        }

        let channel = ClientChannel::spawn(
            id,
            self.config.max_client_queue,
            self.config.default_throttle,
            tx,
        );
        state.clients.insert(id, channel);
        metrics::set_connected_clients(state.clients.len());
        drop(state);

        info!(client_id = id, "Client connected");
        ClientConnection { id, outbound }
    }

    /// Subscribe a client to symbols.
    ///
    /// Updates throttle and simulated latency when supplied, replaces the
    /// indicator set for each named symbol, and starts missing feeds.
    /// Acknowledges with the client's full symbol list.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::EmptySymbols`] when no symbol is given,
    /// [`ProtocolError::UnknownClient`] when the client is not connected.
    /// Neither changes any state.
    pub fn subscribe(
        &self,
        client_id: ClientId,
        request: SubscribeRequest,
    ) -> Result<ServerMessage, ProtocolError> {
        let symbols = dedupe(request.symbols.unwrap_or_default());
        if symbols.is_empty() {
            return Err(ProtocolError::EmptySymbols);
        }
        let requested: IndicatorSet = request.indicators.unwrap_or_default().into_iter().collect();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let client = state
            .clients
            .get_mut(&client_id)
            .ok_or(ProtocolError::UnknownClient(client_id))?;

        client.configure(
            request.throttle_ms.map(Duration::from_millis),
            request.simulate_latency_ms.map(Duration::from_millis),
        );
        for symbol in &symbols {
            client.indicators.insert(symbol.clone(), requested.clone());
        }

        self.registry.subscribe(client_id, &symbols);
        for symbol in &symbols {
            self.ensure_feed(&mut state.feeds, symbol);
        }
        drop(guard);

        let mut held: Vec<Symbol> = self.registry.client_symbols(client_id).into_iter().collect();
        held.sort_unstable();

        debug!(client_id, symbols = ?symbols, "Client subscribed");
        Ok(ServerMessage::Subscribed {
            symbols: held,
            indicators: requested.into_iter().collect(),
        })
    }

    /// Unsubscribe a client from symbols; an empty list means all of them.
    ///
    /// The client stays connected. Queued updates for removed symbols are
    /// discarded and feeds left without subscribers are retired.
    /// Acknowledges with the symbols actually removed.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownClient`] when the client is not connected.
    pub fn unsubscribe(
        &self,
        client_id: ClientId,
        symbols: Vec<Symbol>,
    ) -> Result<ServerMessage, ProtocolError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let client = state
            .clients
            .get_mut(&client_id)
            .ok_or(ProtocolError::UnknownClient(client_id))?;

        let held = self.registry.client_symbols(client_id);
        let mut removed: Vec<Symbol> = if symbols.is_empty() {
            held.into_iter().collect()
        } else {
            dedupe(symbols)
                .into_iter()
                .filter(|symbol| held.contains(symbol))
                .collect()
        };
        removed.sort_unstable();

        let deactivated = self.registry.unsubscribe(client_id, Some(&removed));

        let removed_set: HashSet<Symbol> = removed.iter().cloned().collect();
        client.purge(&removed_set);
        client
            .indicators
            .retain(|symbol, _| !removed_set.contains(symbol));

        Self::retire_feeds(&mut state.feeds, &deactivated);
        drop(guard);

        debug!(client_id, symbols = ?removed, "Client unsubscribed");
        Ok(ServerMessage::Unsubscribed { symbols: removed })
    }

    /// Drop a client: implicit full unsubscribe, then discard its delivery
    /// state. Returns whether the client was connected.
    pub fn disconnect(&self, client_id: ClientId) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(channel) = state.clients.remove(&client_id) else {
            return false;
        };

        let deactivated = self.registry.unsubscribe_all(client_id);
        Self::retire_feeds(&mut state.feeds, &deactivated);
        metrics::set_connected_clients(state.clients.len());
        drop(guard);

        let stats = channel.stats();
        drop(channel);

        info!(
            client_id,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "Client disconnected"
        );
        true
    }

    /// Apply one inbound protocol message and return the reply.
    pub fn handle_message(&self, client_id: ClientId, message: ClientMessage) -> ServerMessage {
        let result = match message {
            ClientMessage::Subscribe(request) => self.subscribe(client_id, request),
            ClientMessage::Unsubscribe(request) => self.unsubscribe(client_id, request.symbols),
        };

        result.unwrap_or_else(|e| {
            debug!(client_id, error = %e, "Rejected client request");
            ServerMessage::error(e)
        })
    }

    /// Delivery counters for one client.
    #[must_use]
    pub fn client_stats(&self, client_id: ClientId) -> Option<ClientStats> {
        self.state.lock().clients.get(&client_id).map(ClientChannel::stats)
    }

    /// Engine-wide counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let state = self.state.lock();
        let (delivered, dropped) = state
            .clients
            .values()
            .map(ClientChannel::stats)
            .fold((0, 0), |(delivered, dropped), s| {
                (delivered + s.delivered, dropped + s.dropped)
            });

        EngineStats {
            connected_clients: state.clients.len(),
            active_feeds: state.feeds.len(),
            subscribed_symbols: self.registry.stats().symbol_count,
            delivered,
            dropped,
            feed_errors: state.feeds.values().map(|entry| entry.errors).sum(),
        }
    }

    /// Symbols with a running feed, sorted.
    #[must_use]
    pub fn active_feeds(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.state.lock().feeds.keys().cloned().collect();
        symbols.sort_unstable();
        symbols
    }

    /// The subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Stop every feed and drop every client.
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        let mut state = self.state.lock();
        for client_id in state.clients.keys() {
            self.registry.unsubscribe_all(*client_id);
        }
        let clients = state.clients.len();
        state.clients.clear();
        state.feeds.clear();
        metrics::set_connected_clients(0);
        metrics::set_active_feeds(0);
        drop(state);

        info!(clients, "Broadcast engine shut down");
    }

    fn ensure_feed(&self, feeds: &mut HashMap<Symbol, FeedEntry>, symbol: &str) {
        if !feeds.contains_key(symbol) {
            self.start_feed(feeds, SymbolFeed::with_random_price(symbol));
        }
    }

    fn start_feed(&self, feeds: &mut HashMap<Symbol, FeedEntry>, feed: SymbolFeed) {
        let symbol = feed.symbol().to_string();
        let cancel = self.shutdown.child_token();
        tokio::spawn(run_feed(
            self.this.clone(),
            symbol.clone(),
            self.config.feed,
            cancel.clone(),
        ));

        info!(symbol = %symbol, price = feed.price(), "Feed started");
        feeds.insert(
            symbol,
            FeedEntry {
                feed,
                errors: 0,
                cancel,
            },
        );
        metrics::set_active_feeds(feeds.len());
    }

    fn retire_feeds(feeds: &mut HashMap<Symbol, FeedEntry>, symbols: &[Symbol]) {
        for symbol in symbols {
            if let Some(entry) = feeds.remove(symbol) {
                entry.cancel.cancel();
                info!(symbol = %symbol, "Feed stopped");
            }
        }
        metrics::set_active_feeds(feeds.len());
    }

    /// Advance one feed and fan the tick out. False once the feed is gone.
    fn tick(&self, symbol: &str) -> bool {
        let timestamp = self.clock.now_ms();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.feeds.get_mut(symbol) else {
            return false;
        };

        let tick = match entry.feed.tick(timestamp) {
            Ok(tick) => tick,
            Err(e) => {
                entry.errors += 1;
                drop(guard);
                metrics::record_feed_error();
                warn!(symbol, error = %e, "Feed tick failed");
                return true;
            }
        };

        for client_id in self.registry.subscribers(symbol) {
            let Some(client) = state.clients.get(&client_id) else {
                continue;
            };
            let indicators = client
                .indicators
                .get(symbol)
                .and_then(|requested| tick.indicators.select(requested));

            client.enqueue(UpdateMessage {
                symbol: symbol.to_string(),
                timestamp: tick.timestamp,
                price: tick.price,
                indicators,
            });
        }
        true
    }
}

impl SymbolUniverse for BroadcastEngine {
    fn all_symbols(&self) -> HashSet<Symbol> {
        self.registry.all_symbols()
    }
}

impl Drop for BroadcastEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_feed(
    engine: Weak<BroadcastEngine>,
    symbol: Symbol,
    config: FeedConfig,
    cancel: CancellationToken,
) {
    loop {
        let delay = jittered_delay(config.tick_min, config.tick_max);
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        let Some(engine) = engine.upgrade() else {
            break;
        };
        if cancel.is_cancelled() || !engine.tick(&symbol) {
            break;
        }
    }
    debug!(symbol = %symbol, "Feed task exited");
}

fn dedupe(symbols: Vec<Symbol>) -> Vec<Symbol> {
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .filter(|symbol| seen.insert(symbol.clone()))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
