use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use position_sizer::SizingModel;

use crate::error::BacktestError;
use crate::market_condition::MarketCondition;

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: f64,
}

/// Validated, ascending-time candle series.
///
/// Construction is the only data gate in the core: duplicate or
/// out-of-order timestamps, non-positive prices, inverted high/low and
/// non-finite volume are all rejected up front so the simulation loop can
/// trust every candle it reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<Candle>", into = "Vec<Candle>")]
pub struct PriceSeries {
    candles: Vec<Candle>,
}

impl PriceSeries {
    pub fn new(candles: Vec<Candle>) -> Result<Self, BacktestError> {
        if candles.len() < 2 {
            return Err(BacktestError::InsufficientData {
                len: candles.len(),
                required: 2,
            });
        }
        for (i, c) in candles.iter().enumerate() {
            if c.open <= Decimal::ZERO
                || c.high <= Decimal::ZERO
                || c.low <= Decimal::ZERO
                || c.close <= Decimal::ZERO
            {
                return Err(BacktestError::InvalidSeries(format!(
                    "non-positive price at index {i}"
                )));
            }
            if c.high < c.low {
                return Err(BacktestError::InvalidSeries(format!(
                    "high below low at index {i}"
                )));
            }
            if !c.volume.is_finite() || c.volume < 0.0 {
                return Err(BacktestError::InvalidSeries(format!(
                    "invalid volume at index {i}"
                )));
            }
            if i > 0 && c.timestamp <= candles[i - 1].timestamp {
                return Err(BacktestError::InvalidSeries(format!(
                    "timestamps not strictly increasing at index {i}"
                )));
            }
        }
        Ok(Self { candles })
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first(&self) -> &Candle {
        &self.candles[0]
    }

    pub fn last(&self) -> &Candle {
        &self.candles[self.candles.len() - 1]
    }
}

impl std::ops::Index<usize> for PriceSeries {
    type Output = Candle;

    fn index(&self, index: usize) -> &Candle {
        &self.candles[index]
    }
}

impl TryFrom<Vec<Candle>> for PriceSeries {
    type Error = BacktestError;

    fn try_from(candles: Vec<Candle>) -> Result<Self, Self::Error> {
        Self::new(candles)
    }
}

impl From<PriceSeries> for Vec<Candle> {
    fn from(series: PriceSeries) -> Self {
        series.candles
    }
}

/// A strategy's decision for one candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// Caller-supplied trading logic.
///
/// The engine calls `signal` once per candle with read-only access to all
/// candles up to and including `index`. An `Err` aborts the run and is
/// reported with the failing candle index.
pub trait Strategy {
    fn signal(&self, series: &PriceSeries, index: usize) -> Result<Signal, String>;

    /// Number of leading candles the strategy needs before it can emit its
    /// first signal. The engine starts its walk here.
    fn warmup(&self) -> usize {
        0
    }

    fn name(&self) -> &str {
        "unnamed"
    }
}

impl<F> Strategy for F
where
    F: Fn(&PriceSeries, usize) -> Result<Signal, String>,
{
    fn signal(&self, series: &PriceSeries, index: usize) -> Result<Signal, String> {
        self(series, index)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

// --- Risk policy ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStop {
    /// Distance below the peak price since entry, in percent.
    pub distance_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureInitial {
    /// Unrealized gain (percent) at which the stop tightens to break-even.
    pub threshold_profit_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleOutLevel {
    pub profit_threshold_percent: f64,
    /// Fraction of the remaining quantity to exit at this level, in percent.
    pub exit_fraction_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleOut {
    /// Must be ordered by strictly increasing profit threshold.
    pub levels: Vec<ScaleOutLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityAdjustment {
    /// Trailing candles used to measure per-period volatility for sizing.
    pub lookback: usize,
}

/// Immutable per-run risk management policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicy {
    pub fee_percent: f64,
    pub slippage_percent: f64,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_stop: Option<TrailingStop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_initial: Option<SecureInitial>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_out: Option<ScaleOut>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volatility_adjustment: Option<VolatilityAdjustment>,
    pub max_positions: usize,
    pub max_position_size_percent: f64,
    pub risk_per_trade_percent: f64,
    /// When false the sizing capital base is capped at the initial capital,
    /// so realized profits are set aside instead of compounding.
    pub reinvest_profits: bool,
    /// Regimes in which entries are allowed. `None` allows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_condition_filter: Option<Vec<MarketCondition>>,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            fee_percent: 0.1,
            slippage_percent: 0.05,
            stop_loss_percent: 5.0,
            take_profit_percent: 10.0,
            trailing_stop: None,
            secure_initial: None,
            scale_out: None,
            volatility_adjustment: None,
            max_positions: 1,
            max_position_size_percent: 25.0,
            risk_per_trade_percent: 2.0,
            reinvest_profits: true,
            market_condition_filter: None,
        }
    }
}

impl RiskPolicy {
    /// Reject malformed policies before any candle is processed.
    pub fn validate(&self) -> Result<(), BacktestError> {
        let invalid = |msg: String| Err(BacktestError::InvalidConfig(msg));

        if !(0.0..100.0).contains(&self.fee_percent) {
            return invalid(format!("fee_percent {} out of [0, 100)", self.fee_percent));
        }
        if !(0.0..100.0).contains(&self.slippage_percent) {
            return invalid(format!(
                "slippage_percent {} out of [0, 100)",
                self.slippage_percent
            ));
        }
        if self.stop_loss_percent <= 0.0 || self.stop_loss_percent >= 100.0 {
            return invalid(format!(
                "stop_loss_percent {} out of (0, 100)",
                self.stop_loss_percent
            ));
        }
        if self.take_profit_percent <= 0.0 {
            return invalid(format!(
                "take_profit_percent {} must be positive",
                self.take_profit_percent
            ));
        }
        if let Some(ts) = &self.trailing_stop {
            if ts.distance_percent <= 0.0 || ts.distance_percent >= 100.0 {
                return invalid(format!(
                    "trailing stop distance {} out of (0, 100)",
                    ts.distance_percent
                ));
            }
        }
        if let Some(si) = &self.secure_initial {
            if si.threshold_profit_percent <= 0.0 {
                return invalid(format!(
                    "secure initial threshold {} must be positive",
                    si.threshold_profit_percent
                ));
            }
        }
        if let Some(so) = &self.scale_out {
            if so.levels.is_empty() {
                return invalid("scale_out configured with no levels".to_string());
            }
            let mut prev_threshold = 0.0;
            for (i, level) in so.levels.iter().enumerate() {
                if level.profit_threshold_percent <= prev_threshold {
                    return invalid(format!(
                        "scale_out level {i} threshold {} not strictly increasing",
                        level.profit_threshold_percent
                    ));
                }
                if level.exit_fraction_percent <= 0.0 || level.exit_fraction_percent > 100.0 {
                    return invalid(format!(
                        "scale_out level {i} exit fraction {} out of (0, 100]",
                        level.exit_fraction_percent
                    ));
                }
                prev_threshold = level.profit_threshold_percent;
            }
        }
        if let Some(va) = &self.volatility_adjustment {
            if va.lookback < 2 {
                return invalid(format!(
                    "volatility_adjustment lookback {} below minimum of 2",
                    va.lookback
                ));
            }
        }
        if self.max_positions == 0 {
            return invalid("max_positions must be at least 1".to_string());
        }
        if self.max_position_size_percent <= 0.0 || self.max_position_size_percent > 100.0 {
            return invalid(format!(
                "max_position_size_percent {} out of (0, 100]",
                self.max_position_size_percent
            ));
        }
        if self.risk_per_trade_percent <= 0.0 || self.risk_per_trade_percent > 100.0 {
            return invalid(format!(
                "risk_per_trade_percent {} out of (0, 100]",
                self.risk_per_trade_percent
            ));
        }
        if let Some(filter) = &self.market_condition_filter {
            if filter.is_empty() {
                return invalid("market_condition_filter allows no regime".to_string());
            }
        }
        Ok(())
    }
}

/// Configuration for one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub strategy_name: String,
    pub symbol: String,
    pub initial_capital: Decimal,
    /// Candle periods per year, used for annualization (252 for daily
    /// equities, 365 for daily crypto, 8760 for hourly).
    pub periods_per_year: f64,
    pub sizing_model: SizingModel,
    pub policy: RiskPolicy,
    /// Informational label carried through to the result for sweep callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_target: Option<String>,
}

impl BacktestConfig {
    pub fn new(strategy_name: &str, symbol: &str, initial_capital: Decimal) -> Self {
        Self {
            strategy_name: strategy_name.to_string(),
            symbol: symbol.to_string(),
            initial_capital,
            periods_per_year: 365.0,
            sizing_model: SizingModel::Fixed,
            policy: RiskPolicy::default(),
            optimization_target: None,
        }
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(BacktestError::InvalidConfig(
                "initial_capital must be positive".to_string(),
            ));
        }
        if self.periods_per_year <= 0.0 {
            return Err(BacktestError::InvalidConfig(format!(
                "periods_per_year {} must be positive",
                self.periods_per_year
            )));
        }
        self.policy.validate()
    }
}

// --- Run output ---

/// Why a position (or part of one) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    ScaleOut,
    SecureInitial,
    SignalSell,
    EndOfData,
}

/// A completed (possibly partial) round trip. Partial scale-out exits emit
/// one trade per level; together with the final close they conserve the
/// entry quantity exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub entry_date: DateTime<Utc>,
    pub exit_date: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub pnl_percent: f64,
    pub fees: Decimal,
    pub slippage: Decimal,
    pub holding_period_days: i64,
    pub exit_reason: ExitReason,
    /// Regime label at entry time, used for per-condition performance.
    pub entry_condition: MarketCondition,
}

/// A point on the equity curve, one per processed candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

/// Percentage decline from the running equity peak, one per processed
/// candle. Zero at a fresh peak, negative below it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownPoint {
    pub timestamp: DateTime<Utc>,
    pub drawdown_percent: f64,
}

/// Calendar-month equity change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyReturn {
    pub year: i32,
    pub month: u32,
    pub return_percent: f64,
}

/// Trades bucketed by the market condition active at their entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConditionStats {
    pub condition: MarketCondition,
    pub trades: usize,
    pub winning_trades: usize,
    pub win_rate: f64,
    pub total_return_percent: f64,
    pub avg_return_percent: f64,
}

/// Summary statistics derived from a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return_percent: f64,
    pub annualized_return_percent: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// 0-100; 0 when no trades closed.
    pub win_rate: f64,
    /// Gross profit / gross loss. `None` with no closed trades;
    /// `Some(f64::INFINITY)` when there are profits but no losses.
    pub profit_factor: Option<f64>,
    /// Mean pnl percent per closed trade.
    pub expectancy_percent: f64,
    /// 0.0 (not NaN) when the return deviation is zero.
    pub sharpe_ratio: f64,
    /// 0.0 (not NaN) when there are no negative returns.
    pub sortino_ratio: f64,
    /// Magnitude of the deepest drawdown, as a positive percentage.
    pub max_drawdown_percent: f64,
    /// Longest run of consecutive candles spent below a prior equity peak.
    pub max_drawdown_duration: usize,
    pub calmar_ratio: f64,
    /// Candles with at least one open position / total candles, 0-100.
    pub market_exposure_percent: f64,
    pub avg_holding_period_days: f64,
    pub average_win: Option<Decimal>,
    pub average_loss: Option<Decimal>,
    pub largest_win: Option<Decimal>,
    pub largest_loss: Option<Decimal>,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub recovery_factor: Option<f64>,
    pub market_condition_performance: Vec<MarketConditionStats>,
    pub monthly_returns: Vec<MonthlyReturn>,
}

/// Strategy vs buy-and-hold over the same series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkComparison {
    pub buy_hold_return_percent: f64,
    /// Strategy total return minus buy-and-hold return.
    pub alpha: f64,
    pub buy_hold_equity_curve: Vec<EquityPoint>,
}

/// Complete output of one run. Built once, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_name: String,
    pub symbol: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub initial_capital: Decimal,
    /// Cash after the end-of-data force close; with every position closed
    /// this equals final equity.
    pub final_equity: Decimal,
    pub total_fees: Decimal,
    pub total_slippage: Decimal,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub drawdown_curve: Vec<DrawdownPoint>,
    pub metrics: PerformanceMetrics,
    pub benchmark: BenchmarkComparison,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_target: Option<String>,
}

/// Distribution of outcomes from bootstrap-resampled trade sequences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub simulations: usize,
    pub median_return_percent: f64,
    pub mean_return_percent: f64,
    pub std_dev_return_percent: f64,
    pub percentile_5: f64,
    pub percentile_25: f64,
    pub percentile_75: f64,
    pub percentile_95: f64,
    pub probability_of_profit: f64,
    /// Probability of losing more than half the starting capital.
    pub probability_of_ruin: f64,
    pub median_max_drawdown_percent: f64,
}
