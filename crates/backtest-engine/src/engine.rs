use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use portfolio_risk::{PortfolioSnapshot, PositionSnapshot};
use position_sizer::{PositionSizer, TradeHistory};

use crate::error::BacktestError;
use crate::market_condition::MarketConditionClassifier;
use crate::metrics::compute_metrics;
use crate::models::*;

/// Cooperative cancellation flag, checked once per candle. Cloning shares
/// the underlying flag, so one token can abort a whole parameter sweep.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// An open position being tracked during the simulation.
struct OpenPosition {
    entry_date: DateTime<Utc>,
    /// The actual fill price (includes buy-side slippage).
    entry_price: Decimal,
    quantity: Decimal,
    remaining_quantity: Decimal,
    peak_price: Decimal,
    initial_stop: Decimal,
    /// Stop used by the stop-loss gate each candle. Starts at the initial
    /// stop and is raised to break-even when secure-initial arms; keeping a
    /// single recomputed level avoids order-of-check bugs between the
    /// interacting stop features.
    effective_stop: Decimal,
    secured: bool,
    /// Scale-out levels fire in threshold order, so a count suffices.
    levels_hit: usize,
    entry_condition: crate::market_condition::MarketCondition,
    entry_fee_total: Decimal,
    entry_fee_remaining: Decimal,
    entry_slippage_total: Decimal,
    entry_slippage_remaining: Decimal,
}

/// Mutable run accounting, separated from the open-position list so closes
/// can borrow a position and the books at the same time.
struct RunState {
    symbol: String,
    cash: Decimal,
    trades: Vec<Trade>,
    history: TradeHistory,
    total_fees: Decimal,
    total_slippage: Decimal,
    sell_mult: Decimal,
    fee_rate: Decimal,
}

impl RunState {
    /// Close `qty` of a position at the candle close (sell-side slippage
    /// applied) and emit the trade. Entry fees/slippage are attributed
    /// pro rata, with the final close absorbing any remainder so that
    /// partial trades sum exactly to the position's entry cost.
    fn close_quantity(
        &mut self,
        pos: &mut OpenPosition,
        qty: Decimal,
        candle: &Candle,
        reason: ExitReason,
    ) {
        let raw = candle.close;
        let fill = raw * self.sell_mult;
        let gross = fill * qty;
        let exit_fee = gross * self.fee_rate;
        let exit_slippage = (raw - fill) * qty;
        let proceeds = gross - exit_fee;

        let closes_out = qty == pos.remaining_quantity;
        let entry_fee_share = if closes_out {
            pos.entry_fee_remaining
        } else {
            (pos.entry_fee_total * qty / pos.quantity).min(pos.entry_fee_remaining)
        };
        pos.entry_fee_remaining -= entry_fee_share;
        let entry_slippage_share = if closes_out {
            pos.entry_slippage_remaining
        } else {
            (pos.entry_slippage_total * qty / pos.quantity).min(pos.entry_slippage_remaining)
        };
        pos.entry_slippage_remaining -= entry_slippage_share;

        let entry_cost = pos.entry_price * qty + entry_fee_share;
        let pnl = proceeds - entry_cost;
        let entry_f64 = pos.entry_price.to_f64().unwrap_or(1.0);
        let fill_f64 = fill.to_f64().unwrap_or(0.0);
        let pnl_percent = if entry_f64 > 0.0 {
            (fill_f64 / entry_f64 - 1.0) * 100.0
        } else {
            0.0
        };

        pos.remaining_quantity -= qty;
        self.cash += proceeds;
        self.total_fees += exit_fee;
        self.total_slippage += exit_slippage;
        self.history.record(pnl_percent / 100.0);

        tracing::debug!(
            symbol = %self.symbol,
            ?reason,
            %qty,
            pnl_percent,
            "position closed"
        );

        self.trades.push(Trade {
            symbol: self.symbol.clone(),
            entry_date: pos.entry_date,
            exit_date: candle.timestamp,
            entry_price: pos.entry_price,
            exit_price: fill,
            quantity: qty,
            pnl,
            pnl_percent,
            fees: entry_fee_share + exit_fee,
            slippage: entry_slippage_share + exit_slippage,
            holding_period_days: (candle.timestamp - pos.entry_date).num_days(),
            exit_reason: reason,
            entry_condition: pos.entry_condition,
        });
    }
}

/// Candle-by-candle simulation of one strategy under one risk policy.
///
/// The walk is strictly sequential: trailing-stop and secure-initial state
/// depend on temporal order, so candle i+1 is never touched before candle
/// i's mutations complete. Exit checks run in a fixed priority order per
/// candle — stop-loss, take-profit, trailing-stop, secure-initial arming,
/// scale-out — and when a gapping candle crosses both the stop and the
/// target, the stop wins (conservative policy choice).
pub struct SimulationEngine {
    config: BacktestConfig,
    sizer: PositionSizer,
    classifier: MarketConditionClassifier,
}

impl SimulationEngine {
    pub fn new(config: BacktestConfig) -> Result<Self, BacktestError> {
        config.validate()?;
        let lookback = config
            .policy
            .volatility_adjustment
            .as_ref()
            .map(|va| va.lookback)
            .unwrap_or(20);
        let sizer = PositionSizer {
            max_position_size_percent: config.policy.max_position_size_percent,
            ..PositionSizer::default()
        };
        Ok(Self {
            config,
            sizer,
            classifier: MarketConditionClassifier::with_lookback(lookback),
        })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn run(
        &self,
        series: &PriceSeries,
        strategy: &dyn Strategy,
    ) -> Result<BacktestResult, BacktestError> {
        self.run_with_cancel(series, strategy, &CancelToken::new())
    }

    pub fn run_with_cancel(
        &self,
        series: &PriceSeries,
        strategy: &dyn Strategy,
        cancel: &CancelToken,
    ) -> Result<BacktestResult, BacktestError> {
        let warmup = strategy.warmup();
        if warmup + 1 > series.len() {
            return Err(BacktestError::InsufficientData {
                len: series.len(),
                required: warmup + 1,
            });
        }

        let policy = &self.config.policy;
        let initial_capital = self.config.initial_capital;

        tracing::info!(
            strategy = strategy.name(),
            symbol = %self.config.symbol,
            candles = series.len(),
            %initial_capital,
            "starting backtest"
        );

        let fee_rate = Decimal::from_f64(policy.fee_percent / 100.0).unwrap_or(Decimal::ZERO);
        let slip_rate = Decimal::from_f64(policy.slippage_percent / 100.0).unwrap_or(Decimal::ZERO);
        let buy_mult = Decimal::ONE + slip_rate;
        let stop_mult =
            Decimal::from_f64(1.0 - policy.stop_loss_percent / 100.0).unwrap_or(Decimal::ONE);
        let tp_mult =
            Decimal::from_f64(1.0 + policy.take_profit_percent / 100.0).unwrap_or(Decimal::ONE);
        let trail_mult = policy
            .trailing_stop
            .as_ref()
            .and_then(|ts| Decimal::from_f64(1.0 - ts.distance_percent / 100.0));

        let mut state = RunState {
            symbol: self.config.symbol.clone(),
            cash: initial_capital,
            trades: Vec::new(),
            history: TradeHistory::new(),
            total_fees: Decimal::ZERO,
            total_slippage: Decimal::ZERO,
            sell_mult: Decimal::ONE - slip_rate,
            fee_rate,
        };
        let mut open: Vec<OpenPosition> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::new();
        let mut drawdown_curve: Vec<DrawdownPoint> = Vec::new();
        let mut peak_equity = initial_capital;
        let mut exposed_candles = 0usize;

        for i in warmup..series.len() {
            if cancel.is_cancelled() {
                tracing::warn!(index = i, "backtest cancelled");
                return Err(BacktestError::Cancelled { index: i });
            }
            let candle = &series[i];
            let close = candle.close;

            // 1. Mark-to-market: ratchet peaks, record equity and drawdown
            for pos in &mut open {
                if close > pos.peak_price {
                    pos.peak_price = close;
                }
            }
            let positions_value: Decimal =
                open.iter().map(|p| p.remaining_quantity * close).sum();
            let equity = state.cash + positions_value;
            if equity > peak_equity {
                peak_equity = equity;
            }
            let peak_f64 = peak_equity.to_f64().unwrap_or(1.0);
            let equity_f64 = equity.to_f64().unwrap_or(0.0);
            let drawdown_percent = if peak_f64 > 0.0 {
                (equity_f64 - peak_f64) / peak_f64 * 100.0
            } else {
                0.0
            };
            equity_curve.push(EquityPoint {
                timestamp: candle.timestamp,
                equity,
            });
            drawdown_curve.push(DrawdownPoint {
                timestamp: candle.timestamp,
                drawdown_percent,
            });
            if !open.is_empty() {
                exposed_candles += 1;
            }

            // 2. Exit checks in priority order; the first close/reduction
            // short-circuits the rest for that position on this candle.
            let mut idx = 0;
            while idx < open.len() {
                let full_exit = {
                    let pos = &open[idx];
                    if close <= pos.effective_stop {
                        // The stop gate fires on the tightened stop; the
                        // reason records which component was binding.
                        Some(if close <= pos.initial_stop {
                            ExitReason::StopLoss
                        } else {
                            ExitReason::SecureInitial
                        })
                    } else if close >= pos.entry_price * tp_mult {
                        Some(ExitReason::TakeProfit)
                    } else if let Some(tm) = trail_mult {
                        // Armed only once price has moved favorably
                        if pos.peak_price > pos.entry_price && close <= pos.peak_price * tm {
                            Some(ExitReason::TrailingStop)
                        } else {
                            None
                        }
                    } else {
                        None
                    }
                };

                if let Some(reason) = full_exit {
                    let mut pos = open.remove(idx);
                    let qty = pos.remaining_quantity;
                    state.close_quantity(&mut pos, qty, candle, reason);
                    continue;
                }

                let pos = &mut open[idx];
                let gain_percent = {
                    let entry = pos.entry_price.to_f64().unwrap_or(1.0);
                    let close_f64 = close.to_f64().unwrap_or(0.0);
                    if entry > 0.0 {
                        (close_f64 / entry - 1.0) * 100.0
                    } else {
                        0.0
                    }
                };

                // Secure-initial arms the break-even stop for later candles;
                // it never closes anything itself.
                if let Some(si) = &policy.secure_initial {
                    if !pos.secured && gain_percent >= si.threshold_profit_percent {
                        pos.secured = true;
                        if pos.entry_price > pos.effective_stop {
                            pos.effective_stop = pos.entry_price;
                        }
                        tracing::debug!(index = i, "secure-initial armed, stop at break-even");
                    }
                }

                // Scale-out: several levels may fire on one candle
                if let Some(so) = &policy.scale_out {
                    while pos.levels_hit < so.levels.len()
                        && pos.remaining_quantity > Decimal::ZERO
                    {
                        let level = &so.levels[pos.levels_hit];
                        if gain_percent < level.profit_threshold_percent {
                            break;
                        }
                        let qty = if level.exit_fraction_percent >= 100.0 {
                            pos.remaining_quantity
                        } else {
                            let frac = Decimal::from_f64(level.exit_fraction_percent / 100.0)
                                .unwrap_or(Decimal::ZERO);
                            pos.remaining_quantity * frac
                        };
                        pos.levels_hit += 1;
                        if qty <= Decimal::ZERO {
                            continue;
                        }
                        state.close_quantity(pos, qty, candle, ExitReason::ScaleOut);
                    }
                    if pos.remaining_quantity <= Decimal::ZERO {
                        open.remove(idx);
                        continue;
                    }
                }

                idx += 1;
            }

            // 3./4. Strategy signal: entries and signal-driven exits
            let signal = strategy
                .signal(series, i)
                .map_err(|message| BacktestError::Strategy { index: i, message })?;
            match signal {
                Signal::Buy => {
                    self.try_open_position(series, i, candle, &mut open, &mut state, buy_mult, stop_mult);
                }
                Signal::Sell => {
                    while let Some(mut pos) = open.pop() {
                        let qty = pos.remaining_quantity;
                        state.close_quantity(&mut pos, qty, candle, ExitReason::SignalSell);
                    }
                }
                Signal::Hold => {}
            }
        }

        // End of data: force-close what is left so all P&L is attributable
        let last = series.last();
        while let Some(mut pos) = open.pop() {
            let qty = pos.remaining_quantity;
            state.close_quantity(&mut pos, qty, last, ExitReason::EndOfData);
        }

        let final_equity = state.cash;
        let total_candles = series.len() - warmup;
        let metrics = compute_metrics(
            &state.trades,
            &equity_curve,
            &drawdown_curve,
            initial_capital,
            final_equity,
            self.config.periods_per_year,
            exposed_candles,
            total_candles,
        );
        let benchmark = compute_benchmark(series, warmup, initial_capital, &metrics);

        tracing::info!(
            trades = state.trades.len(),
            total_return_percent = metrics.total_return_percent,
            "backtest finished"
        );

        Ok(BacktestResult {
            strategy_name: self.config.strategy_name.clone(),
            symbol: self.config.symbol.clone(),
            start_date: series[warmup].timestamp,
            end_date: last.timestamp,
            initial_capital,
            final_equity,
            total_fees: state.total_fees,
            total_slippage: state.total_slippage,
            trades: state.trades,
            equity_curve,
            drawdown_curve,
            metrics,
            benchmark,
            optimization_target: self.config.optimization_target.clone(),
        })
    }

    /// Entry path: regime filter, position cap, sizing, exposure check,
    /// then the cash debit at the slipped fill.
    #[allow(clippy::too_many_arguments)]
    fn try_open_position(
        &self,
        series: &PriceSeries,
        index: usize,
        candle: &Candle,
        open: &mut Vec<OpenPosition>,
        state: &mut RunState,
        buy_mult: Decimal,
        stop_mult: Decimal,
    ) {
        let policy = &self.config.policy;
        if open.len() >= policy.max_positions {
            tracing::debug!(index, "buy signal ignored: position cap reached");
            return;
        }

        let condition = self.classifier.classify(series, index);
        if let Some(filter) = &policy.market_condition_filter {
            if !filter.contains(&condition) {
                tracing::debug!(index, condition = condition.name(), "entry filtered by regime");
                return;
            }
        }

        let close = candle.close;
        let cash_f64 = state.cash.to_f64().unwrap_or(0.0);
        let initial_f64 = self.config.initial_capital.to_f64().unwrap_or(0.0);
        // Capital-base toggle: without reinvestment, profits above the
        // starting capital never enter the sizing base.
        let base = if policy.reinvest_profits {
            cash_f64
        } else {
            cash_f64.min(initial_f64)
        };

        let volatility_percent = self
            .trailing_volatility(series, index)
            .unwrap_or(self.sizer.reference_volatility_percent);

        let mut value = self.sizer.size(
            base,
            policy.risk_per_trade_percent,
            policy.stop_loss_percent,
            volatility_percent,
            self.config.sizing_model,
            &state.history,
        );

        // Exposure limit: assess the prospective portfolio with the
        // candidate included; its share of total value may not exceed the
        // per-position cap.
        let mut snap_positions: Vec<PositionSnapshot> = open
            .iter()
            .map(|p| PositionSnapshot {
                symbol: self.config.symbol.clone(),
                quantity: p.remaining_quantity.to_f64().unwrap_or(0.0),
                entry_price: p.entry_price.to_f64().unwrap_or(0.0),
                current_value: (p.remaining_quantity * close).to_f64().unwrap_or(0.0),
            })
            .collect();
        snap_positions.push(PositionSnapshot {
            symbol: self.config.symbol.clone(),
            quantity: 0.0,
            entry_price: close.to_f64().unwrap_or(0.0),
            current_value: value,
        });
        let snapshot = PortfolioSnapshot {
            positions: snap_positions,
            cash_balance: cash_f64 - value,
        };
        if let Ok(assessment) = portfolio_risk::assess_risk(&snapshot, None) {
            if let Some(candidate) = assessment.per_position_risk.last() {
                if candidate.risk_percent > policy.max_position_size_percent {
                    value = snapshot.total_value() * policy.max_position_size_percent / 100.0;
                }
            }
        }

        // Entry fee comes out of the same cash
        value = value.min(cash_f64 / (1.0 + policy.fee_percent / 100.0));
        if value <= 0.0 {
            return;
        }

        let fill = close * buy_mult;
        let value_dec = match Decimal::from_f64(value) {
            Some(v) if v > Decimal::ZERO => v,
            _ => return,
        };
        let quantity = value_dec / fill;
        if quantity <= Decimal::ZERO {
            return;
        }
        let notional = fill * quantity;
        let fee = notional * state.fee_rate;
        let slippage_cost = (fill - close) * quantity;

        state.cash -= notional + fee;
        state.total_fees += fee;
        state.total_slippage += slippage_cost;

        tracing::debug!(
            index,
            condition = condition.name(),
            %fill,
            %quantity,
            "position opened"
        );

        open.push(OpenPosition {
            entry_date: candle.timestamp,
            entry_price: fill,
            quantity,
            remaining_quantity: quantity,
            peak_price: fill,
            initial_stop: fill * stop_mult,
            effective_stop: fill * stop_mult,
            secured: false,
            levels_hit: 0,
            entry_condition: condition,
            entry_fee_total: fee,
            entry_fee_remaining: fee,
            entry_slippage_total: slippage_cost,
            entry_slippage_remaining: slippage_cost,
        });
    }

    /// Per-period volatility (percent) over the classifier's lookback,
    /// ending at `index`. `None` until enough candles have accumulated.
    fn trailing_volatility(&self, series: &PriceSeries, index: usize) -> Option<f64> {
        let lookback = self.classifier.lookback;
        if index + 1 <= lookback {
            return None;
        }
        let closes: Vec<f64> = series.candles()[index - lookback..=index]
            .iter()
            .map(|c| c.close.to_f64().unwrap_or(0.0))
            .collect();
        portfolio_risk::volatility(&closes, lookback)
    }
}

/// Buy-and-hold over the processed range, for strategy-vs-market alpha.
fn compute_benchmark(
    series: &PriceSeries,
    warmup: usize,
    initial_capital: Decimal,
    metrics: &PerformanceMetrics,
) -> BenchmarkComparison {
    let first_close = series[warmup].close;
    let shares = initial_capital / first_close;

    let buy_hold_equity_curve: Vec<EquityPoint> = series.candles()[warmup..]
        .iter()
        .map(|c| EquityPoint {
            timestamp: c.timestamp,
            equity: shares * c.close,
        })
        .collect();

    let initial_f64 = initial_capital.to_f64().unwrap_or(1.0);
    let final_f64 = buy_hold_equity_curve
        .last()
        .map(|p| p.equity.to_f64().unwrap_or(0.0))
        .unwrap_or(initial_f64);
    let buy_hold_return_percent = if initial_f64 > 0.0 {
        (final_f64 / initial_f64 - 1.0) * 100.0
    } else {
        0.0
    };

    BenchmarkComparison {
        buy_hold_return_percent,
        alpha: metrics.total_return_percent - buy_hold_return_percent,
        buy_hold_equity_curve,
    }
}
