//! Backoff and Jitter
//!
//! Exponential backoff for symbols whose fetch keeps failing. Each failure
//! bumps the attempt count and pushes the symbol's next allowed poll time
//! out by `min(base * 2^(attempt-1), max)`. A success clears the entry.
//!
//! Also hosts the uniform jitter used to space recurring timers.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::domain::market::{EpochMillis, Symbol};

/// Delay drawn uniformly from `[min, max]` at millisecond resolution.
///
/// Returns `min` when `max <= min`.
#[must_use]
pub fn jittered_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }

    let min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms <= min_ms {
        return min;
    }
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

/// Delay schedule for consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy. `max` below `base` caps every delay at `max`.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay applied after the `attempt`-th consecutive failure (1-based).
    ///
    /// # Example
    ///
    /// ```rust
    /// use quote_relay::application::services::backoff::BackoffPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
    /// assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    /// assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    /// assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    /// ```
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u128
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u128::MAX);
        let millis = self
            .base
            .as_millis()
            .saturating_mul(factor)
            .min(self.max.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Base delay.
    #[must_use]
    pub const fn base(&self) -> Duration {
        self.base
    }

    /// Ceiling.
    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }
}

/// Backoff bookkeeping for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    /// Consecutive failures so far.
    pub attempt: u32,
    /// Earliest time the symbol may be polled again.
    pub next_allowed_at: EpochMillis,
}

impl BackoffState {
    /// Whether the symbol may be polled at `now`.
    #[must_use]
    pub const fn is_eligible(&self, now: EpochMillis) -> bool {
        now >= self.next_allowed_at
    }
}

/// Backoff state for every currently failing symbol.
#[derive(Debug, Default)]
pub struct BackoffTable {
    policy: BackoffPolicy,
    entries: HashMap<Symbol, BackoffState>,
}

impl BackoffTable {
    /// Create an empty table.
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    /// Whether `symbol` may be polled at `now`. Symbols without state always may.
    #[must_use]
    pub fn is_eligible(&self, symbol: &str, now: EpochMillis) -> bool {
        self.entries
            .get(symbol)
            .is_none_or(|state| state.is_eligible(now))
    }

    /// Apply one backoff step and return the updated state.
    pub fn record_failure(&mut self, symbol: &str, now: EpochMillis) -> BackoffState {
        let policy = self.policy;
        let state = self
            .entries
            .entry(symbol.to_string())
            .or_insert(BackoffState {
                attempt: 0,
                next_allowed_at: now,
            });

        state.attempt = state.attempt.saturating_add(1);
        let wait = i64::try_from(policy.delay_for(state.attempt).as_millis()).unwrap_or(i64::MAX);
        state.next_allowed_at = now.saturating_add(wait);
        *state
    }

    /// Clear the symbol's state. Returns whether it was backed off.
    pub fn record_success(&mut self, symbol: &str) -> bool {
        self.entries.remove(symbol).is_some()
    }

    /// Current state for a symbol.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<BackoffState> {
        self.entries.get(symbol).copied()
    }

    /// Symbols still waiting at `now`.
    #[must_use]
    pub fn waiting(&self, now: EpochMillis) -> usize {
        self.entries
            .values()
            .filter(|state| !state.is_eligible(now))
            .count()
    }

    /// Symbols with any backoff state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no symbol is backed off.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
