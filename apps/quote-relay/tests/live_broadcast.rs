//! Live Broadcast Integration Tests
//!
//! Exercises fan-out, per-client throttling and backpressure through the
//! public engine API, on paused tokio time.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use quote_relay::application::services::broadcast::FeedConfig;
use quote_relay::domain::streaming::SubscribeRequest;
use quote_relay::infrastructure::clock::SystemClock;
use quote_relay::{
    BroadcastEngine, EngineConfig, Indicator, ServerMessage, SubscriptionRegistry, UpdateMessage,
};

// =============================================================================
// Fixtures
// =============================================================================

fn engine(max_client_queue: usize) -> Arc<BroadcastEngine> {
    let config = EngineConfig {
        feed: FeedConfig {
            tick_min: Duration::from_millis(10),
            tick_max: Duration::from_millis(15),
        },
        max_client_queue,
        ..EngineConfig::default()
    };
    BroadcastEngine::new(
        config,
        Arc::new(SubscriptionRegistry::new()),
        Arc::new(SystemClock),
    )
}

fn subscribe(symbols: &[&str]) -> SubscribeRequest {
    SubscribeRequest {
        symbols: Some(symbols.iter().map(ToString::to_string).collect()),
        ..SubscribeRequest::default()
    }
}

/// Drain a client's outbound channel in the background, recording the
/// arrival time of every update.
fn collect(
    mut outbound: mpsc::Receiver<ServerMessage>,
) -> JoinHandle<Vec<(Instant, UpdateMessage)>> {
    tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(message) = outbound.recv().await {
            if let ServerMessage::Update(update) = message {
                received.push((Instant::now(), update));
            }
        }
        received
    })
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn slow_client_drops_without_affecting_fast_client() {
    let engine = engine(3);
    let fast = engine.connect();
    let slow = engine.connect();

    engine.subscribe(fast.id, subscribe(&["A"])).unwrap();
    engine
        .subscribe(
            slow.id,
            SubscribeRequest {
                simulate_latency_ms: Some(50),
                ..subscribe(&["A"])
            },
        )
        .unwrap();

    let fast_rx = collect(fast.outbound);
    let slow_rx = collect(slow.outbound);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let fast_stats = engine.client_stats(fast.id).unwrap();
    let slow_stats = engine.client_stats(slow.id).unwrap();

    assert_eq!(fast_stats.dropped, 0);
    assert!(slow_stats.dropped > 0, "slow client should shed updates");
    assert!(slow_stats.queued <= 3);
    assert!(fast_stats.delivered > slow_stats.delivered);

    engine.shutdown();
    let fast_updates = fast_rx.await.unwrap();
    let slow_updates = slow_rx.await.unwrap();

    // The fast client sees every tick, in order.
    let stamps: Vec<i64> = fast_updates.iter().map(|(_, u)| u.timestamp).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    assert!(fast_updates.len() as u64 >= fast_stats.delivered);
    assert!(slow_updates.len() < fast_updates.len());
}

#[tokio::test(start_paused = true)]
async fn throttle_spaces_updates_per_symbol() {
    let engine = engine(100);
    let conn = engine.connect();
    engine
        .subscribe(
            conn.id,
            SubscribeRequest {
                throttle_ms: Some(100),
                ..subscribe(&["A", "B"])
            },
        )
        .unwrap();

    let rx = collect(conn.outbound);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stats = engine.client_stats(conn.id).unwrap();
    assert!(stats.throttled > 0);
    assert_eq!(stats.dropped, 0);

    engine.shutdown();
    let updates = rx.await.unwrap();

    let mut last_seen: HashMap<String, Instant> = HashMap::new();
    for (at, update) in updates {
        if let Some(previous) = last_seen.insert(update.symbol.clone(), at) {
            assert!(
                at.duration_since(previous) >= Duration::from_millis(100),
                "{} delivered twice within the throttle window",
                update.symbol
            );
        }
    }
    assert_eq!(last_seen.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn each_client_receives_only_its_symbols_and_indicators() {
    let engine = engine(100);
    let a_only = engine.connect();
    let both = engine.connect();

    engine.subscribe(a_only.id, subscribe(&["A"])).unwrap();
    engine
        .subscribe(
            both.id,
            SubscribeRequest {
                indicators: Some(vec![Indicator::Ema, Indicator::Rsi]),
                ..subscribe(&["A", "B"])
            },
        )
        .unwrap();

    let a_rx = collect(a_only.outbound);
    let both_rx = collect(both.outbound);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(engine.stats().active_feeds, 2);
    assert_eq!(engine.stats().subscribed_symbols, 2);

    engine.shutdown();
    let a_updates = a_rx.await.unwrap();
    let both_updates = both_rx.await.unwrap();

    assert!(!a_updates.is_empty());
    for (_, update) in &a_updates {
        assert_eq!(update.symbol, "A");
        assert!(update.indicators.is_none());
    }

    assert!(both_updates.iter().any(|(_, u)| u.symbol == "B"));
    for (_, update) in &both_updates {
        let indicators = update.indicators.unwrap();
        assert!(indicators.sma.is_none());
        assert!(indicators.ema.is_some());
        let rsi = indicators.rsi.unwrap();
        assert!((0.0..=100.0).contains(&rsi));
    }
}

#[tokio::test(start_paused = true)]
async fn disconnect_keeps_shared_feed_for_remaining_clients() {
    let engine = engine(100);
    let leaving = engine.connect();
    let staying = engine.connect();

    engine.subscribe(leaving.id, subscribe(&["A", "B"])).unwrap();
    engine.subscribe(staying.id, subscribe(&["A"])).unwrap();
    assert_eq!(engine.active_feeds(), vec!["A".to_string(), "B".to_string()]);

    let staying_rx = collect(staying.outbound);
    drop(leaving.outbound);
    assert!(engine.disconnect(leaving.id));

    assert_eq!(engine.active_feeds(), vec!["A".to_string()]);
    assert_eq!(engine.stats().connected_clients, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let delivered = engine.client_stats(staying.id).unwrap().delivered;
    assert!(delivered > 0);

    engine.shutdown();
    let updates = staying_rx.await.unwrap();
    assert!(updates.iter().all(|(_, u)| u.symbol == "A"));
}
