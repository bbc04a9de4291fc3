//! Per-Client Delivery
//!
//! Every connected client owns a bounded FIFO of pending updates and one
//! delivery worker that drains it, one message at a time.
//!
//! # Contract
//!
//! - **Throttle**: an update for a symbol is dropped when the last update
//!   *sent* for that symbol is younger than the client's throttle interval.
//!   Checked on enqueue and again right before sending.
//! - **Backpressure**: a full queue rejects the newest update and counts it.
//! - **Single flight**: the worker hands one update to the transport and
//!   waits until the transport has taken it before dequeuing the next. Only
//!   then does the update count as sent. Optional simulated latency delays
//!   each send.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::domain::indicators::IndicatorSet;
use crate::domain::market::Symbol;
use crate::domain::streaming::{ServerMessage, UpdateMessage};
use crate::domain::subscription::ClientId;
use crate::infrastructure::metrics::{self, DropReason};

/// Delivery counters for one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Updates taken by the transport.
    pub delivered: u64,
    /// Updates rejected by a full queue.
    pub dropped: u64,
    /// Updates dropped by the throttle.
    pub throttled: u64,
    /// Updates waiting in the queue.
    pub queued: usize,
}

/// What happened to an offered update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Waiting for the worker.
    Queued,
    /// Inside the throttle interval.
    Throttled,
    /// Queue full.
    Dropped,
}

#[derive(Debug)]
struct DeliveryState {
    throttle: Duration,
    latency: Duration,
    queue: VecDeque<UpdateMessage>,
    last_sent: HashMap<Symbol, Instant>,
    delivered: u64,
    dropped: u64,
    throttled: u64,
}

impl DeliveryState {
    fn within_throttle(&self, symbol: &str, now: Instant) -> bool {
        if self.throttle.is_zero() {
            return false;
        }
        self.last_sent
            .get(symbol)
            .is_some_and(|sent| now.saturating_duration_since(*sent) < self.throttle)
    }
}

/// Delivery side of one connected client.
pub(crate) struct ClientChannel {
    id: ClientId,
    capacity: usize,
    state: Arc<Mutex<DeliveryState>>,
    ready: Arc<Notify>,
    cancel: CancellationToken,
    /// Indicators requested per subscribed symbol.
    pub(crate) indicators: HashMap<Symbol, IndicatorSet>,
}

impl ClientChannel {
    /// Create the channel and spawn its delivery worker.
    pub(crate) fn spawn(
        id: ClientId,
        capacity: usize,
        throttle: Duration,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        let state = Arc::new(Mutex::new(DeliveryState {
            throttle,
            latency: Duration::ZERO,
            queue: VecDeque::with_capacity(capacity),
            last_sent: HashMap::new(),
            delivered: 0,
            dropped: 0,
            throttled: 0,
        }));
        let ready = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let worker = DeliveryWorker {
            id,
            state: Arc::clone(&state),
            ready: Arc::clone(&ready),
            cancel: cancel.clone(),
            outbound,
        };
        tokio::spawn(worker.run());

        Self {
            id,
            capacity,
            state,
            ready,
            cancel,
            indicators: HashMap::new(),
        }
    }

    /// Offer an update, applying throttle then backpressure.
    pub(crate) fn enqueue(&self, update: UpdateMessage) -> EnqueueOutcome {
        let mut state = self.state.lock();

        if state.within_throttle(&update.symbol, Instant::now()) {
            state.throttled += 1;
            drop(state);
            metrics::record_update_dropped(DropReason::Throttled);
            return EnqueueOutcome::Throttled;
        }

        if state.queue.len() >= self.capacity {
            state.dropped += 1;
            drop(state);
            metrics::record_update_dropped(DropReason::Backpressure);
            trace!(client_id = self.id, "Client queue full, update dropped");
            return EnqueueOutcome::Dropped;
        }

        state.queue.push_back(update);
        drop(state);
        self.ready.notify_one();
        EnqueueOutcome::Queued
    }

    /// Update throttle and simulated latency; `None` keeps the current value.
    pub(crate) fn configure(&self, throttle: Option<Duration>, latency: Option<Duration>) {
        let mut state = self.state.lock();
        if let Some(throttle) = throttle {
            state.throttle = throttle;
        }
        if let Some(latency) = latency {
            state.latency = latency;
        }
    }

    /// Forget queued updates and throttle history for removed symbols.
    pub(crate) fn purge(&self, symbols: &HashSet<Symbol>) {
        let mut state = self.state.lock();
        state.queue.retain(|update| !symbols.contains(&update.symbol));
        state.last_sent.retain(|symbol, _| !symbols.contains(symbol));
    }

    /// Counter snapshot.
    pub(crate) fn stats(&self) -> ClientStats {
        let state = self.state.lock();
        ClientStats {
            delivered: state.delivered,
            dropped: state.dropped,
            throttled: state.throttled,
            queued: state.queue.len(),
        }
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Delivery Worker
// =============================================================================

struct DeliveryWorker {
    id: ClientId,
    state: Arc<Mutex<DeliveryState>>,
    ready: Arc<Notify>,
    cancel: CancellationToken,
    outbound: mpsc::Sender<ServerMessage>,
}

impl DeliveryWorker {
    async fn run(self) {
        loop {
            let next = self.state.lock().queue.pop_front();

            let Some(update) = next else {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = self.ready.notified() => {}
                }
                continue;
            };

            let latency = {
                let mut state = self.state.lock();
                if state.within_throttle(&update.symbol, Instant::now()) {
                    state.throttled += 1;
                    drop(state);
                    metrics::record_update_dropped(DropReason::Throttled);
                    continue;
                }
                state.latency
            };

            if !latency.is_zero() {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(latency) => {}
                }
            }

            let symbol = update.symbol.clone();
            let sent = tokio::select! {
                () = self.cancel.cancelled() => break,
                sent = self.outbound.send(ServerMessage::Update(update)) => sent,
            };
            if sent.is_err() {
                debug!(client_id = self.id, "Client receiver closed, stopping delivery");
                break;
            }

            // The outbound buffer holds a single message, so a free slot means
            // the transport has taken this one.
            let taken = tokio::select! {
                () = self.cancel.cancelled() => break,
                permit = self.outbound.reserve() => permit,
            };
            if taken.is_err() {
                debug!(client_id = self.id, "Client receiver closed, stopping delivery");
                break;
            }
            drop(taken);

            let mut state = self.state.lock();
            state.last_sent.insert(symbol, Instant::now());
            state.delivered += 1;
            drop(state);
            metrics::record_update_delivered();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn update(symbol: &str, timestamp: i64) -> UpdateMessage {
        UpdateMessage {
            symbol: symbol.to_string(),
            timestamp,
            price: 100.0,
            indicators: None,
        }
    }

    async fn recv_update(rx: &mut mpsc::Receiver<ServerMessage>) -> UpdateMessage {
        match rx.recv().await {
            Some(ServerMessage::Update(update)) => update,
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_enqueue_order() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = ClientChannel::spawn(1, 10, Duration::ZERO, tx);

        for ts in 1..=5 {
            assert_eq!(channel.enqueue(update("A", ts)), EnqueueOutcome::Queued);
        }

        for ts in 1..=5 {
            assert_eq!(recv_update(&mut rx).await.timestamp, ts);
        }
        tokio::task::yield_now().await;
        assert_eq!(channel.stats().delivered, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_newest() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = ClientChannel::spawn(1, 3, Duration::ZERO, tx);
        channel.configure(None, Some(Duration::from_millis(100)));

        let outcomes: Vec<_> = (1..=6).map(|ts| channel.enqueue(update("A", ts))).collect();
        assert_eq!(&outcomes[..3], &[EnqueueOutcome::Queued; 3]);
        assert_eq!(&outcomes[3..], &[EnqueueOutcome::Dropped; 3]);
        assert_eq!(channel.stats().dropped, 3);

        // Oldest survive; the rejected ones never show up.
        for ts in 1..=3 {
            assert_eq!(recv_update(&mut rx).await.timestamp, ts);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_deliveries() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = ClientChannel::spawn(1, 10, Duration::from_millis(200), tx);

        channel.enqueue(update("A", 1));
        let first = recv_update(&mut rx).await;
        let first_at = Instant::now();
        assert_eq!(first.timestamp, 1);
        tokio::task::yield_now().await;

        // Inside the window: dropped on enqueue.
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(channel.enqueue(update("A", 2)), EnqueueOutcome::Throttled);

        // Another symbol is not affected.
        assert_eq!(channel.enqueue(update("B", 3)), EnqueueOutcome::Queued);
        assert_eq!(recv_update(&mut rx).await.symbol, "B");

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(channel.enqueue(update("A", 4)), EnqueueOutcome::Queued);
        recv_update(&mut rx).await;
        assert!(Instant::now().duration_since(first_at) >= Duration::from_millis(200));
        assert_eq!(channel.stats().throttled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_duplicates_are_throttled_at_dequeue() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = ClientChannel::spawn(1, 10, Duration::from_millis(500), tx);

        // Both pass the enqueue check because nothing was sent yet.
        channel.enqueue(update("A", 1));
        channel.enqueue(update("A", 2));

        assert_eq!(recv_update(&mut rx).await.timestamp, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(channel.stats().throttled, 1);
        assert_eq!(channel.stats().queued, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_pending_updates_for_symbols() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = ClientChannel::spawn(1, 10, Duration::ZERO, tx);
        channel.configure(None, Some(Duration::from_millis(100)));

        channel.enqueue(update("A", 1));
        tokio::task::yield_now().await;
        channel.enqueue(update("A", 2));
        channel.enqueue(update("B", 3));

        channel.purge(&HashSet::from(["A".to_string()]));

        assert_eq!(recv_update(&mut rx).await.timestamp, 1);
        assert_eq!(recv_update(&mut rx).await.symbol, "B");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_consumer_holds_one_update_beyond_the_queue() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = ClientChannel::spawn(1, 3, Duration::ZERO, tx);

        let mut outcomes = Vec::new();
        for ts in 1..=5 {
            outcomes.push(channel.enqueue(update("A", ts)));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // One handed to the transport, three waiting, the newest rejected.
        assert_eq!(&outcomes[..4], &[EnqueueOutcome::Queued; 4]);
        assert_eq!(outcomes[4], EnqueueOutcome::Dropped);
        assert_eq!(rx.len(), 1);
        assert_eq!(
            channel.stats(),
            ClientStats {
                delivered: 0,
                dropped: 1,
                throttled: 0,
                queued: 3,
            }
        );

        assert_eq!(recv_update(&mut rx).await.timestamp, 1);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(channel.stats().delivered, 1);
        assert_eq!(channel.stats().queued, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_holds_at_a_slow_consumer() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = ClientChannel::spawn(1, 10, Duration::from_millis(100), tx);

        let consumer = tokio::spawn(async move {
            let mut arrivals = Vec::new();
            loop {
                tokio::time::sleep(Duration::from_millis(95)).await;
                match rx.recv().await {
                    Some(_) => arrivals.push(Instant::now()),
                    None => break,
                }
            }
            arrivals
        });

        for ts in 0..50 {
            channel.enqueue(update("A", ts));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(channel);

        let arrivals = consumer.await.unwrap();
        assert!(arrivals.len() >= 3);
        for pair in arrivals.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drop_stops_worker_and_closes_outbound() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = ClientChannel::spawn(1, 10, Duration::ZERO, tx);
        drop(channel);

        assert!(rx.recv().await.is_none());
    }
}
