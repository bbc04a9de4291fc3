//! Ingestion Scheduler
//!
//! Periodically polls the upstream for every subscribed symbol, writes the
//! latest quote and the merged candle window to the cache, and backs off
//! symbols that keep failing.
//!
//! # Run Lifecycle
//!
//! ```text
//! Idle ──poll_once──► Fetching ──(done / error / panic)──► Idle
//!                        │
//!                        └── poll_once while Fetching ──► AlreadyRunning
//! ```
//!
//! Overlapping runs are rejected, never queued. Between runs the scheduler
//! sleeps a uniformly jittered interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::{
    CacheStore, Clock, SymbolUniverse, UpstreamItem, UpstreamSource, get_json, set_json,
};
use crate::application::services::backoff::{BackoffPolicy, BackoffTable, jittered_delay};
use crate::domain::market::{Candle, CandleWindow, EpochMillis, Symbol, klines_key, quote_key};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionConfig {
    /// Shortest pause between runs.
    pub min_interval: Duration,
    /// Longest pause between runs.
    pub max_interval: Duration,
    /// TTL applied to every cache write.
    pub cache_ttl: Duration,
    /// Maximum candles kept per symbol.
    pub klines_window_size: usize,
    /// Backoff for failing symbols.
    pub backoff: BackoffPolicy,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(3),
            cache_ttl: Duration::from_secs(60),
            klines_window_size: 500,
            backoff: BackoffPolicy::default(),
        }
    }
}

// =============================================================================
// Outcome and Stats
// =============================================================================

/// Result of one [`IngestionScheduler::poll_once`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Upstream answered; `updated` symbols were written to the cache.
    Completed {
        /// Symbols written this run.
        updated: usize,
    },
    /// Nothing subscribed, or everything is backed off.
    NoEligibleSymbols,
    /// The upstream call failed; every eligible symbol was backed off.
    UpstreamFailed,
    /// Another run was in flight.
    AlreadyRunning,
}

impl PollOutcome {
    /// Whether the run reached the upstream and succeeded.
    #[must_use]
    pub const fn ran(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::NoEligibleSymbols => "no_eligible_symbols",
            Self::UpstreamFailed => "upstream_failed",
            Self::AlreadyRunning => "already_running",
        }
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionStats {
    /// Runs that completed against the upstream.
    pub runs_completed: u64,
    /// Runs whose upstream call failed.
    pub runs_failed: u64,
    /// Runs rejected or with nothing to do.
    pub runs_skipped: u64,
    /// Symbols currently waiting out a backoff.
    pub backed_off_symbols: usize,
    /// Time of the last completed run.
    pub last_success_at: Option<EpochMillis>,
}

// =============================================================================
// In-flight Guard
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollState {
    Idle,
    Fetching,
}

/// Returns the scheduler to `Idle` when dropped, including on panic.
struct FetchGuard<'a> {
    state: &'a Mutex<PollState>,
}

impl<'a> FetchGuard<'a> {
    fn acquire(state: &'a Mutex<PollState>) -> Option<Self> {
        let mut current = state.lock();
        if *current == PollState::Fetching {
            return None;
        }
        *current = PollState::Fetching;
        Some(Self { state })
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = PollState::Idle;
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives periodic polls and owns per-symbol backoff.
pub struct IngestionScheduler {
    universe: Arc<dyn SymbolUniverse>,
    upstream: Arc<dyn UpstreamSource>,
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    config: IngestionConfig,
    state: Mutex<PollState>,
    backoff: Mutex<BackoffTable>,
    stats: Mutex<IngestionStats>,
    timer: Mutex<Option<CancellationToken>>,
}

impl IngestionScheduler {
    /// Create a stopped scheduler.
    #[must_use]
    pub fn new(
        universe: Arc<dyn SymbolUniverse>,
        upstream: Arc<dyn UpstreamSource>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            universe,
            upstream,
            cache,
            clock,
            config,
            state: Mutex::new(PollState::Idle),
            backoff: Mutex::new(BackoffTable::new(config.backoff)),
            stats: Mutex::new(IngestionStats::default()),
            timer: Mutex::new(None),
        }
    }

    /// Start the recurring poll loop. No-op if already started.
    ///
    /// The first run happens after one jittered interval.
    pub fn start(self: &Arc<Self>) {
        let token = {
            let mut timer = self.timer.lock();
            if timer.is_some() {
                debug!("Ingestion scheduler already started");
                return;
            }
            let token = CancellationToken::new();
            *timer = Some(token.clone());
            token
        };

        info!(
            min_interval_ms = self.config.min_interval.as_millis(),
            max_interval_ms = self.config.max_interval.as_millis(),
            "Ingestion scheduler started"
        );

        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(token).await });
    }

    /// Cancel the pending timer. An in-flight upstream call still completes,
    /// but no further run is scheduled until [`Self::start`].
    pub fn stop(&self) {
        if let Some(token) = self.timer.lock().take() {
            token.cancel();
            info!("Ingestion scheduler stopped");
        }
    }

    /// Whether the poll loop is scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> IngestionStats {
        let mut stats = *self.stats.lock();
        stats.backed_off_symbols = self.backoff.lock().waiting(self.clock.now_ms());
        stats
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &IngestionConfig {
        &self.config
    }

    async fn run(&self, token: CancellationToken) {
        loop {
            let delay = jittered_delay(self.config.min_interval, self.config.max_interval);
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            let outcome = self.poll_once().await;
            debug!(outcome = outcome.as_str(), "Poll run finished");
        }
    }

    /// Run one poll.
    ///
    /// Returns [`PollOutcome::AlreadyRunning`] without touching the upstream
    /// when another run is in flight.
    pub async fn poll_once(&self) -> PollOutcome {
        let Some(_guard) = FetchGuard::acquire(&self.state) else {
            debug!("Poll skipped, previous run still in flight");
            return self.finish(PollOutcome::AlreadyRunning);
        };

        let eligible = self.eligible_symbols();
        if eligible.is_empty() {
            return self.finish(PollOutcome::NoEligibleSymbols);
        }

        let started = Instant::now();
        let outcome = match self.upstream.fetch(&eligible).await {
            Ok(batch) => {
                let mut updated = 0;
                for symbol in &eligible {
                    if let Some(item) = batch.items.get(symbol) {
                        self.store(symbol, item).await;
                        self.backoff.lock().record_success(symbol);
                        updated += 1;
                    } else if batch.failed.contains(symbol) {
                        let state = self.backoff.lock().record_failure(symbol, self.clock.now_ms());
                        debug!(
                            symbol = %symbol,
                            attempt = state.attempt,
                            next_allowed_at = state.next_allowed_at,
                            "Symbol failed upstream, backing off"
                        );
                    }
                }
                PollOutcome::Completed { updated }
            }
            Err(e) => {
                let now = self.clock.now_ms();
                {
                    let mut backoff = self.backoff.lock();
                    for symbol in &eligible {
                        backoff.record_failure(symbol, now);
                    }
                }
                metrics::record_upstream_failure();
                warn!(error = %e, symbols = eligible.len(), "Upstream fetch failed, backing off");
                PollOutcome::UpstreamFailed
            }
        };

        metrics::record_poll_duration(started.elapsed());
        self.finish(outcome)
    }

    fn eligible_symbols(&self) -> Vec<Symbol> {
        let now = self.clock.now_ms();
        let backoff = self.backoff.lock();
        let mut eligible: Vec<Symbol> = self
            .universe
            .all_symbols()
            .into_iter()
            .filter(|symbol| backoff.is_eligible(symbol, now))
            .collect();
        eligible.sort_unstable();
        eligible
    }

    async fn store(&self, symbol: &str, item: &UpstreamItem) {
        let ttl = self.config.cache_ttl;

        if let Err(e) = set_json(&*self.cache, &quote_key(symbol), &item.quote, ttl).await {
            warn!(symbol, error = %e, "Failed to cache quote");
        }

        let Some(candle) = item.candle else {
            return;
        };

        let key = klines_key(symbol);
        let cap = self.config.klines_window_size;
        let stored = match get_json::<Vec<Candle>>(&*self.cache, &key).await {
            Ok(candles) => candles.unwrap_or_default(),
            Err(e) => {
                warn!(symbol, error = %e, "Failed to read candle window, starting fresh");
                Vec::new()
            }
        };

        let mut window = CandleWindow::from_candles(stored, cap);
        window.merge(candle, cap);

        if let Err(e) = set_json(&*self.cache, &key, &window, ttl).await {
            warn!(symbol, error = %e, "Failed to cache candle window");
        }
    }

    fn finish(&self, outcome: PollOutcome) -> PollOutcome {
        let now = self.clock.now_ms();
        {
            let mut stats = self.stats.lock();
            match outcome {
                PollOutcome::Completed { .. } => {
                    stats.runs_completed += 1;
                    stats.last_success_at = Some(now);
                }
                PollOutcome::UpstreamFailed => stats.runs_failed += 1,
                PollOutcome::NoEligibleSymbols | PollOutcome::AlreadyRunning => {
                    stats.runs_skipped += 1;
                }
            }
        }

        metrics::record_poll(outcome.as_str());
        metrics::set_backoff_symbols(self.backoff.lock().waiting(now));
        outcome
    }
}

impl Drop for IngestionScheduler {
    fn drop(&mut self) {
        if let Some(token) = self.timer.get_mut().take() {
            token.cancel();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::application::ports::{
        MockCacheStore, MockSymbolUniverse, MockUpstreamSource, UpstreamBatch, UpstreamError,
    };
    use crate::domain::market::Quote;
    use crate::infrastructure::cache::InMemoryCache;

    struct ManualClock(AtomicI64);

    impl ManualClock {
        fn at(ms: EpochMillis) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(ms)))
        }

        fn set(&self, ms: EpochMillis) {
            self.0.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> EpochMillis {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn universe(symbols: &[&str]) -> Arc<MockSymbolUniverse> {
        let set: HashSet<Symbol> = symbols.iter().map(ToString::to_string).collect();
        let mut universe = MockSymbolUniverse::new();
        universe.expect_all_symbols().returning(move || set.clone());
        Arc::new(universe)
    }

    fn item(price: f64, ts: EpochMillis) -> UpstreamItem {
        UpstreamItem {
            quote: Quote {
                price,
                timestamp: ts,
            },
            candle: Some(Candle {
                open: price,
                high: price,
                low: price,
                close: price,
                timestamp: ts - ts % 60_000,
            }),
        }
    }

    fn scheduler(
        universe: Arc<dyn SymbolUniverse>,
        upstream: Arc<dyn UpstreamSource>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> IngestionScheduler {
        IngestionScheduler::new(universe, upstream, cache, clock, IngestionConfig::default())
    }

    #[tokio::test]
    async fn no_subscriptions_is_a_noop() {
        let mut upstream = MockUpstreamSource::new();
        upstream.expect_fetch().never();

        let sched = scheduler(
            universe(&[]),
            Arc::new(upstream),
            Arc::new(InMemoryCache::new()),
            ManualClock::at(0),
        );

        assert_eq!(sched.poll_once().await, PollOutcome::NoEligibleSymbols);
        assert!(!sched.poll_once().await.ran());
        assert_eq!(sched.stats().runs_skipped, 2);
    }

    #[tokio::test]
    async fn success_writes_quote_and_window() {
        let mut upstream = MockUpstreamSource::new();
        upstream
            .expect_fetch()
            .withf(|symbols| symbols == ["A".to_string(), "B".to_string()])
            .times(1)
            .returning(|_| {
                let mut items = HashMap::new();
                items.insert("A".to_string(), item(10.0, 120_500));
                Ok(UpstreamBatch::from(items))
            });

        let cache = Arc::new(InMemoryCache::new());
        let sched = scheduler(
            universe(&["B", "A"]),
            Arc::new(upstream),
            cache.clone(),
            ManualClock::at(1_000),
        );

        assert_eq!(sched.poll_once().await, PollOutcome::Completed { updated: 1 });

        let quote: Quote = get_json(&*cache, "quote:A").await.unwrap().unwrap();
        assert_eq!(quote.price, 10.0);
        let window: Vec<Candle> = get_json(&*cache, "klines:A").await.unwrap().unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].timestamp, 120_000);

        // Missing from the result: untouched, not backed off.
        assert!(cache.get("quote:B").await.unwrap().is_none());
        assert!(sched.backoff.lock().get("B").is_none());

        let stats = sched.stats();
        assert_eq!(stats.runs_completed, 1);
        assert_eq!(stats.last_success_at, Some(1_000));
    }

    #[tokio::test]
    async fn wholesale_failure_backs_off_every_eligible_symbol() {
        let mut upstream = MockUpstreamSource::new();
        upstream
            .expect_fetch()
            .times(1)
            .returning(|_| Err(UpstreamError::Timeout));

        let mut cache = MockCacheStore::new();
        cache.expect_set().never();

        let clock = ManualClock::at(5_000);
        let sched = scheduler(
            universe(&["A", "B"]),
            Arc::new(upstream),
            Arc::new(cache),
            clock.clone(),
        );

        assert_eq!(sched.poll_once().await, PollOutcome::UpstreamFailed);
        for symbol in ["A", "B"] {
            let state = sched.backoff.lock().get(symbol).unwrap();
            assert_eq!(state.attempt, 1);
            assert_eq!(state.next_allowed_at, 6_000);
        }

        // Still inside the window: nothing eligible, upstream not called again.
        clock.set(5_500);
        assert_eq!(sched.poll_once().await, PollOutcome::NoEligibleSymbols);
        assert_eq!(sched.stats().backed_off_symbols, 2);
    }

    #[tokio::test]
    async fn reported_symbol_failure_backs_off_only_that_symbol() {
        let mut upstream = MockUpstreamSource::new();
        upstream.expect_fetch().returning(|_| {
            let mut items = HashMap::new();
            items.insert("A".to_string(), item(1.0, 60_000));
            Ok(UpstreamBatch::from(items).with_failed("B"))
        });

        let sched = scheduler(
            universe(&["A", "B", "C"]),
            Arc::new(upstream),
            Arc::new(InMemoryCache::new()),
            ManualClock::at(0),
        );

        assert!(sched.poll_once().await.ran());
        let backoff = sched.backoff.lock();
        assert!(backoff.get("A").is_none());
        assert_eq!(backoff.get("B").unwrap().attempt, 1);
        assert!(backoff.get("C").is_none());
    }

    #[tokio::test]
    async fn cache_write_failure_does_not_abort_run() {
        let mut upstream = MockUpstreamSource::new();
        upstream.expect_fetch().returning(|_| {
            let mut items = HashMap::new();
            items.insert("A".to_string(), item(1.0, 60_000));
            items.insert("B".to_string(), item(2.0, 60_000));
            Ok(UpstreamBatch::from(items))
        });

        let mut cache = MockCacheStore::new();
        cache.expect_get().returning(|_| {
            Err(crate::application::ports::CacheError::Unavailable {
                message: "down".to_string(),
            })
        });
        cache.expect_set().returning(|_, _, _| {
            Err(crate::application::ports::CacheError::Unavailable {
                message: "down".to_string(),
            })
        });

        let sched = scheduler(
            universe(&["A", "B"]),
            Arc::new(upstream),
            Arc::new(cache),
            ManualClock::at(0),
        );

        assert_eq!(sched.poll_once().await, PollOutcome::Completed { updated: 2 });
    }

    /// Upstream that parks until released, counting calls.
    struct GatedUpstream {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl UpstreamSource for GatedUpstream {
        async fn fetch(&self, _symbols: &[Symbol]) -> Result<UpstreamBatch, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(UpstreamBatch::default())
        }
    }

    #[tokio::test]
    async fn overlapping_poll_is_rejected() {
        let upstream = Arc::new(GatedUpstream {
            calls: AtomicUsize::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let sched = Arc::new(scheduler(
            universe(&["A"]),
            upstream.clone(),
            Arc::new(InMemoryCache::new()),
            ManualClock::at(0),
        ));

        let first = tokio::spawn({
            let sched = Arc::clone(&sched);
            async move { sched.poll_once().await }
        });
        upstream.entered.notified().await;

        assert_eq!(sched.poll_once().await, PollOutcome::AlreadyRunning);

        upstream.release.notify_one();
        assert!(first.await.unwrap().ran());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        // Guard released: the next run goes through.
        let second = tokio::spawn({
            let sched = Arc::clone(&sched);
            async move { sched.poll_once().await }
        });
        upstream.entered.notified().await;
        upstream.release.notify_one();
        assert!(second.await.unwrap().ran());
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_halts_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut upstream = MockUpstreamSource::new();
        upstream.expect_fetch().returning({
            let calls = Arc::clone(&calls);
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(UpstreamBatch::default())
            }
        });

        let config = IngestionConfig {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(100),
            ..IngestionConfig::default()
        };
        let sched = Arc::new(IngestionScheduler::new(
            universe(&["A"]),
            Arc::new(upstream),
            Arc::new(InMemoryCache::new()),
            ManualClock::at(0),
            config,
        ));

        sched.start();
        sched.start();
        assert!(sched.is_running());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        sched.stop();
        assert!(!sched.is_running());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn outcome_labels() {
        assert!(PollOutcome::Completed { updated: 0 }.ran());
        assert!(!PollOutcome::UpstreamFailed.ran());
        assert_eq!(PollOutcome::AlreadyRunning.as_str(), "already_running");
    }
}
