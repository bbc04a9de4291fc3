//! Derived Indicators
//!
//! Simple moving average, exponential moving average and relative strength
//! index computed from a feed's rolling price history.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Samples averaged by SMA and smoothed by EMA.
pub const MA_WINDOW: usize = 5;

/// Samples (not deltas) considered by RSI.
pub const RSI_PERIOD: usize = 14;

/// RS used when there were no losses, so RSI saturates just below 100.
pub const RSI_NO_LOSS_RS: f64 = 100.0;

/// An indicator a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    /// Simple moving average.
    Sma,
    /// Exponential moving average.
    Ema,
    /// Relative strength index.
    Rsi,
}

impl Indicator {
    /// Get all indicators.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Sma, Self::Ema, Self::Rsi]
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sma => "sma",
            Self::Ema => "ema",
            Self::Rsi => "rsi",
        }
    }
}

/// Set of indicators a client asked for on one symbol.
pub type IndicatorSet = BTreeSet<Indicator>;

/// Indicator values attached to an update. Absent fields are not sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValues {
    /// Simple moving average.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sma: Option<f64>,
    /// Exponential moving average.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema: Option<f64>,
    /// Relative strength index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
}

impl IndicatorValues {
    /// Keep only the requested indicators.
    ///
    /// Returns `None` when nothing was requested so the update omits the
    /// indicators object entirely.
    #[must_use]
    pub fn select(&self, requested: &IndicatorSet) -> Option<Self> {
        if requested.is_empty() {
            return None;
        }

        let pick = |indicator, value: Option<f64>| {
            if requested.contains(&indicator) {
                value
            } else {
                None
            }
        };

        Some(Self {
            sma: pick(Indicator::Sma, self.sma),
            ema: pick(Indicator::Ema, self.ema),
            rsi: pick(Indicator::Rsi, self.rsi),
        })
    }
}

/// Compute every indicator over a history ordered oldest first.
///
/// An empty history yields no values.
#[must_use]
pub fn compute(history: &[f64]) -> IndicatorValues {
    if history.is_empty() {
        return IndicatorValues::default();
    }

    IndicatorValues {
        sma: Some(sma(history, MA_WINDOW)),
        ema: Some(ema(history, MA_WINDOW)),
        rsi: Some(rsi(history, RSI_PERIOD)),
    }
}

fn tail(history: &[f64], window: usize) -> &[f64] {
    &history[history.len().saturating_sub(window)..]
}

/// Arithmetic mean of the last `window` samples (all of them if fewer).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sma(history: &[f64], window: usize) -> f64 {
    let samples = tail(history, window);
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Exponential smoothing over the last `window` samples with
/// `alpha = 2 / (window + 1)`, seeded with the oldest retained sample.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ema(history: &[f64], window: usize) -> f64 {
    let samples = tail(history, window);
    let Some((&first, rest)) = samples.split_first() else {
        return 0.0;
    };

    let alpha = 2.0 / (window as f64 + 1.0);
    rest.iter()
        .fold(first, |acc, &price| alpha.mul_add(price - acc, acc))
}

/// Relative strength index over the last `period` samples.
#[must_use]
pub fn rsi(history: &[f64], period: usize) -> f64 {
    let samples = tail(history, period);

    let (gains, losses) = samples
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold((0.0, 0.0), |(gains, losses), delta| {
            if delta > 0.0 {
                (gains + delta, losses)
            } else {
                (gains, losses - delta)
            }
        });

    let rs = if losses == 0.0 {
        RSI_NO_LOSS_RS
    } else {
        gains / losses
    };

    100.0 - 100.0 / (1.0 + rs)
}

// =============================================================================
// Tests
// =============================================================================
