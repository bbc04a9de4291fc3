//! Prometheus Metrics Module
//!
//! Exposes relay metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ingestion**: Poll outcomes, durations, upstream failures, backoff
//! - **Delivery**: Updates delivered to and dropped for live clients
//! - **Live state**: Connected clients and running symbol feeds
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder was already installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Ingestion
    describe_counter!(
        "quote_relay_polls_total",
        "Total ingestion poll runs by outcome"
    );
    describe_histogram!(
        "quote_relay_poll_duration_seconds",
        "Duration of ingestion poll runs that reached the upstream"
    );
    describe_counter!(
        "quote_relay_upstream_failures_total",
        "Total wholesale upstream fetch failures"
    );
    describe_gauge!(
        "quote_relay_backoff_symbols",
        "Symbols currently waiting out a backoff"
    );

    // Delivery
    describe_counter!(
        "quote_relay_updates_delivered_total",
        "Total live updates sent to clients"
    );
    describe_counter!(
        "quote_relay_updates_dropped_total",
        "Total live updates dropped by reason"
    );

    // Live state
    describe_gauge!(
        "quote_relay_active_feeds",
        "Number of running per-symbol feeds"
    );
    describe_counter!(
        "quote_relay_feed_errors_total",
        "Total feed ticks that failed and were skipped"
    );
    describe_gauge!(
        "quote_relay_connected_clients",
        "Number of connected live clients"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a live update was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Client queue was full.
    Backpressure,
    /// Arrived inside the client's throttle interval.
    Throttled,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Backpressure => "backpressure",
            Self::Throttled => "throttled",
        }
    }
}

/// Record one ingestion poll run.
pub fn record_poll(outcome: &'static str) {
    counter!("quote_relay_polls_total", "outcome" => outcome).increment(1);
}

/// Record how long a poll run spent after selecting its symbols.
pub fn record_poll_duration(duration: Duration) {
    histogram!("quote_relay_poll_duration_seconds").record(duration.as_secs_f64());
}

/// Record a wholesale upstream failure.
pub fn record_upstream_failure() {
    counter!("quote_relay_upstream_failures_total").increment(1);
}

/// Update the number of backed-off symbols.
#[allow(clippy::cast_precision_loss)]
pub fn set_backoff_symbols(count: usize) {
    gauge!("quote_relay_backoff_symbols").set(count as f64);
}

/// Record a delivered live update.
pub fn record_update_delivered() {
    counter!("quote_relay_updates_delivered_total").increment(1);
}

/// Record a dropped live update.
pub fn record_update_dropped(reason: DropReason) {
    counter!("quote_relay_updates_dropped_total", "reason" => reason.as_str()).increment(1);
}

/// Update the running feed count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_feeds(count: usize) {
    gauge!("quote_relay_active_feeds").set(count as f64);
}

/// Record a skipped feed tick.
pub fn record_feed_error() {
    counter!("quote_relay_feed_errors_total").increment(1);
}

/// Update the connected client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_connected_clients(count: usize) {
    gauge!("quote_relay_connected_clients").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
