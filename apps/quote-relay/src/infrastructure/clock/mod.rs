//! Wall Clock
//!
//! [`Clock`] backed by the system time via `chrono`.

use chrono::Utc;

use crate::application::ports::Clock;
use crate::domain::market::EpochMillis;

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> EpochMillis {
        Utc::now().timestamp_millis()
    }
}
