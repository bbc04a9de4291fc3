//! Synthetic Upstream
//!
//! [`UpstreamSource`] that invents prices: each symbol random-walks from a
//! random start and builds one-minute bars from the walk. Stands in for a
//! real provider, whose wire formats are outside this crate.
//!
//! Only symbols named in the latest fetch keep their walk; a symbol that
//! comes back later starts over.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use crate::application::ports::{Clock, UpstreamBatch, UpstreamError, UpstreamItem, UpstreamSource};
use crate::domain::market::{Candle, EpochMillis, Quote, Symbol};

/// Bar length.
pub const BAR_MILLIS: EpochMillis = 60_000;

/// Start of the bar containing `timestamp`.
#[must_use]
pub const fn bar_start(timestamp: EpochMillis) -> EpochMillis {
    timestamp - timestamp.rem_euclid(BAR_MILLIS)
}

#[derive(Debug, Clone, Copy)]
struct Walk {
    price: f64,
    bar: Candle,
}

/// Random-walk price source.
pub struct SyntheticUpstream {
    clock: Arc<dyn Clock>,
    walks: Mutex<HashMap<Symbol, Walk>>,
}

impl SyntheticUpstream {
    /// Create a source with no history.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            walks: Mutex::new(HashMap::new()),
        }
    }

    fn advance(walk: &mut Walk, now: EpochMillis, delta: f64) {
        walk.price = (walk.price * (1.0 + delta)).max(0.01);

        let start = bar_start(now);
        if walk.bar.timestamp == start {
            walk.bar.high = walk.bar.high.max(walk.price);
            walk.bar.low = walk.bar.low.min(walk.price);
            walk.bar.close = walk.price;
        } else {
            walk.bar = Candle {
                open: walk.price,
                high: walk.price,
                low: walk.price,
                close: walk.price,
                timestamp: start,
            };
        }
    }
}

#[async_trait]
impl UpstreamSource for SyntheticUpstream {
    async fn fetch(&self, symbols: &[Symbol]) -> Result<UpstreamBatch, UpstreamError> {
        let now = self.clock.now_ms();
        let mut rng = rand::rng();
        let mut walks = self.walks.lock();

        let requested: HashSet<&Symbol> = symbols.iter().collect();
        walks.retain(|symbol, _| requested.contains(symbol));

        let items = symbols
            .iter()
            .map(|symbol| {
                let walk = walks.entry(symbol.clone()).or_insert_with(|| {
                    let price = rng.random_range(10.0..100.0);
                    Walk {
                        price,
                        bar: Candle {
                            open: price,
                            high: price,
                            low: price,
                            close: price,
                            timestamp: bar_start(now),
                        },
                    }
                });
                Self::advance(walk, now, rng.random_range(-0.002..=0.002));

                let item = UpstreamItem {
                    quote: Quote {
                        price: walk.price,
                        timestamp: now,
                    },
                    candle: Some(walk.bar),
                };
                (symbol.clone(), item)
            })
            .collect::<HashMap<_, _>>();

        Ok(UpstreamBatch::from(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockClock;

    fn clock_at(ms: EpochMillis) -> Arc<MockClock> {
        let mut clock = MockClock::new();
        clock.expect_now_ms().return_const(ms);
        Arc::new(clock)
    }

    #[test]
    fn bar_start_floors_to_minute() {
        assert_eq!(bar_start(125_000), 120_000);
        assert_eq!(bar_start(120_000), 120_000);
        assert_eq!(bar_start(59_999), 0);
    }

    #[tokio::test]
    async fn returns_every_requested_symbol() {
        let upstream = SyntheticUpstream::new(clock_at(1_699_999_990_000));
        let symbols = vec!["A".to_string(), "B".to_string()];

        let batch = upstream.fetch(&symbols).await.unwrap();

        assert_eq!(batch.items.len(), 2);
        assert!(batch.failed.is_empty());
        let item = batch.items["A"];
        assert_eq!(item.quote.timestamp, 1_699_999_990_000);
        assert_eq!(item.candle.unwrap().timestamp, 1_699_999_980_000);
    }

    #[tokio::test]
    async fn walks_are_kept_only_for_requested_symbols() {
        let upstream = SyntheticUpstream::new(clock_at(60_000));

        upstream
            .fetch(&["A".to_string(), "B".to_string(), "C".to_string()])
            .await
            .unwrap();
        assert_eq!(upstream.walks.lock().len(), 3);

        upstream.fetch(&["B".to_string()]).await.unwrap();
        let walks = upstream.walks.lock();
        assert_eq!(walks.len(), 1);
        assert!(walks.contains_key("B"));
    }

    #[tokio::test]
    async fn bar_tracks_walk_within_minute() {
        let upstream = SyntheticUpstream::new(clock_at(60_000));
        let symbols = vec!["A".to_string()];

        let mut last = None;
        for _ in 0..20 {
            let batch = upstream.fetch(&symbols).await.unwrap();
            let candle = batch.items["A"].candle.unwrap();
            assert!(candle.low <= candle.close && candle.close <= candle.high);
            assert!(candle.low <= candle.open && candle.open <= candle.high);
            if let Some(open) = last {
                assert_eq!(candle.open, open);
            }
            last = Some(candle.open);
        }
    }
}
