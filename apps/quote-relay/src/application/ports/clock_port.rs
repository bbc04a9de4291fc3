//! Clock Port (Driven Port)

use crate::domain::market::EpochMillis;

/// Source of wall-clock time.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> EpochMillis;
}
