use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One open position inside a [`PortfolioSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    /// Marked-to-market value at snapshot time.
    pub current_value: f64,
}

/// Point-in-time copy of an account's open positions and cash.
///
/// Snapshots are recomputed on demand by the caller and never mutated by the
/// risk calculators; a dashboard refreshing against live data must hand over
/// a fresh copy each time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub positions: Vec<PositionSnapshot>,
    pub cash_balance: f64,
}

impl PortfolioSnapshot {
    pub fn total_value(&self) -> f64 {
        self.cash_balance + self.positions.iter().map(|p| p.current_value).sum::<f64>()
    }

    pub fn invested_value(&self) -> f64 {
        self.positions.iter().map(|p| p.current_value).sum()
    }
}

/// Exposure of a single position relative to the whole portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRisk {
    pub symbol: String,
    pub value: f64,
    pub risk_percent: f64,
}

/// Aggregate risk and diversification metrics over a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Sum of per-position exposure percentages.
    pub total_risk_percent: f64,
    pub max_position_risk_percent: f64,
    /// Herfindahl index of position-value weights, as a percentage.
    /// 100 means everything rides on one position.
    pub risk_concentration_percent: f64,
    /// 0-100, higher is better diversified.
    pub diversification_score: f64,
    pub per_position_risk: Vec<PositionRisk>,
}

/// Symmetric pairwise correlation lookup, keyed by symbol pair.
///
/// Pairs the caller never supplied answer `None`; the assessment treats
/// those as unknown and substitutes a neutral prior rather than assuming
/// the assets are uncorrelated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pairs: HashMap<String, f64>,
}

impl CorrelationMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(a: &str, b: &str) -> String {
        if a <= b {
            format!("{a}|{b}")
        } else {
            format!("{b}|{a}")
        }
    }

    pub fn insert(&mut self, symbol_a: &str, symbol_b: &str, coefficient: f64) {
        self.pairs
            .insert(Self::key(symbol_a, symbol_b), coefficient.clamp(-1.0, 1.0));
    }

    pub fn get(&self, symbol_a: &str, symbol_b: &str) -> Option<f64> {
        self.pairs.get(&Self::key(symbol_a, symbol_b)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
