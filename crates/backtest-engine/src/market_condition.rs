use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::PriceSeries;

/// Coarse market regime label derived from recent price behavior, used to
/// filter entries and to bucket per-regime performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketCondition {
    Bullish,
    Bearish,
    Sideways,
    Volatile,
    LowVolatility,
}

impl MarketCondition {
    pub fn name(&self) -> &'static str {
        match self {
            MarketCondition::Bullish => "bullish",
            MarketCondition::Bearish => "bearish",
            MarketCondition::Sideways => "sideways",
            MarketCondition::Volatile => "volatile",
            MarketCondition::LowVolatility => "low_volatility",
        }
    }
}

/// Rule-based regime classifier over a trailing window of closes.
///
/// Volatility is checked first: an unusually turbulent window is labelled
/// volatile no matter which way it drifts. Otherwise the net move over the
/// window decides bullish/bearish, and quiet windows with no net move fall
/// through to low-volatility or sideways.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConditionClassifier {
    pub lookback: usize,
    /// Per-period return stddev (percent) above which the window is volatile.
    pub high_volatility_percent: f64,
    /// Per-period return stddev (percent) below which the window is calm.
    pub low_volatility_percent: f64,
    /// Net move over the window (percent) needed to call a trend.
    pub trend_threshold_percent: f64,
}

impl Default for MarketConditionClassifier {
    fn default() -> Self {
        Self {
            lookback: 20,
            high_volatility_percent: 3.0,
            low_volatility_percent: 0.5,
            trend_threshold_percent: 5.0,
        }
    }
}

impl MarketConditionClassifier {
    pub fn with_lookback(lookback: usize) -> Self {
        Self {
            lookback: lookback.max(2),
            ..Self::default()
        }
    }

    /// Classify the regime at `index` using the closes up to and including it.
    /// Windows too short to measure default to sideways.
    pub fn classify(&self, series: &PriceSeries, index: usize) -> MarketCondition {
        if index + 1 <= self.lookback {
            return MarketCondition::Sideways;
        }
        let start = index - self.lookback;
        let closes: Vec<f64> = series.candles()[start..=index]
            .iter()
            .map(|c| c.close.to_f64().unwrap_or(0.0))
            .collect();

        let vol = portfolio_risk::volatility(&closes, self.lookback);
        let first = closes[0];
        let last = closes[closes.len() - 1];
        let net_move_percent = if first > 0.0 {
            (last / first - 1.0) * 100.0
        } else {
            0.0
        };

        match vol {
            Some(v) if v > self.high_volatility_percent => MarketCondition::Volatile,
            _ => {
                if net_move_percent >= self.trend_threshold_percent {
                    MarketCondition::Bullish
                } else if net_move_percent <= -self.trend_threshold_percent {
                    MarketCondition::Bearish
                } else if matches!(vol, Some(v) if v < self.low_volatility_percent) {
                    MarketCondition::LowVolatility
                } else {
                    MarketCondition::Sideways
                }
            }
        }
    }
}
