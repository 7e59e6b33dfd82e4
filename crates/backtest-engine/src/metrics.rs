use chrono::Datelike;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::market_condition::MarketCondition;
use crate::models::*;

/// Derive all summary statistics from a finished run.
///
/// Pure over its inputs; degenerate cases (no trades, zero deviation, zero
/// gross loss) produce documented sentinels rather than NaN or panics.
#[allow(clippy::too_many_arguments)]
pub fn compute_metrics(
    trades: &[Trade],
    equity_curve: &[EquityPoint],
    drawdown_curve: &[DrawdownPoint],
    initial_capital: Decimal,
    final_equity: Decimal,
    periods_per_year: f64,
    exposed_candles: usize,
    total_candles: usize,
) -> PerformanceMetrics {
    let initial_f64 = initial_capital.to_f64().unwrap_or(1.0);
    let final_f64 = final_equity.to_f64().unwrap_or(0.0);
    let total_return_percent = if initial_f64 > 0.0 {
        (final_f64 / initial_f64 - 1.0) * 100.0
    } else {
        0.0
    };

    let annualized_return_percent = annualized_return(
        equity_curve,
        initial_f64,
        final_f64,
        total_candles,
        periods_per_year,
    );

    let total_trades = trades.len();
    let winning_trades = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
    let losing_trades = total_trades - winning_trades;
    let win_rate = if total_trades > 0 {
        winning_trades as f64 / total_trades as f64 * 100.0
    } else {
        0.0
    };

    let gross_profit: Decimal = trades
        .iter()
        .filter(|t| t.pnl > Decimal::ZERO)
        .map(|t| t.pnl)
        .sum();
    let gross_loss: Decimal = trades
        .iter()
        .filter(|t| t.pnl < Decimal::ZERO)
        .map(|t| t.pnl.abs())
        .sum();
    let profit_factor = {
        let gp = gross_profit.to_f64().unwrap_or(0.0);
        let gl = gross_loss.to_f64().unwrap_or(0.0);
        if gl > 0.0 {
            Some(gp / gl)
        } else if gp > 0.0 {
            // No losing trade: infinite profit factor by convention
            Some(f64::INFINITY)
        } else {
            None
        }
    };

    let expectancy_percent = if total_trades > 0 {
        trades.iter().map(|t| t.pnl_percent).sum::<f64>() / total_trades as f64
    } else {
        0.0
    };

    let returns = equity_returns(equity_curve);
    let (sharpe_ratio, sortino_ratio) = risk_ratios(&returns, periods_per_year);

    let max_drawdown_percent = drawdown_curve
        .iter()
        .map(|d| d.drawdown_percent)
        .fold(0.0, f64::min)
        .abs();
    let max_drawdown_duration = longest_underwater_run(drawdown_curve);
    let calmar_ratio = if max_drawdown_percent > 0.0 {
        annualized_return_percent / max_drawdown_percent
    } else {
        0.0
    };

    let market_exposure_percent = if total_candles > 0 {
        exposed_candles as f64 / total_candles as f64 * 100.0
    } else {
        0.0
    };

    let avg_holding_period_days = if total_trades > 0 {
        trades.iter().map(|t| t.holding_period_days).sum::<i64>() as f64 / total_trades as f64
    } else {
        0.0
    };

    let average_win = (winning_trades > 0)
        .then(|| gross_profit / Decimal::from(winning_trades as i64));
    let losing_count = trades.iter().filter(|t| t.pnl < Decimal::ZERO).count();
    let average_loss =
        (losing_count > 0).then(|| gross_loss / Decimal::from(losing_count as i64));
    let largest_win = trades
        .iter()
        .map(|t| t.pnl)
        .filter(|p| *p > Decimal::ZERO)
        .fold(None, |acc: Option<Decimal>, p| Some(acc.map_or(p, |v| v.max(p))));
    let largest_loss = trades
        .iter()
        .map(|t| t.pnl)
        .filter(|p| *p < Decimal::ZERO)
        .fold(None, |acc: Option<Decimal>, p| Some(acc.map_or(p, |v| v.min(p))));

    let (max_consecutive_wins, max_consecutive_losses) = consecutive_streaks(trades);

    let recovery_factor = (max_drawdown_percent > 0.0)
        .then_some(total_return_percent / max_drawdown_percent);

    PerformanceMetrics {
        total_return_percent,
        annualized_return_percent,
        total_trades,
        winning_trades,
        losing_trades,
        win_rate,
        profit_factor,
        expectancy_percent,
        sharpe_ratio,
        sortino_ratio,
        max_drawdown_percent,
        max_drawdown_duration,
        calmar_ratio,
        market_exposure_percent,
        avg_holding_period_days,
        average_win,
        average_loss,
        largest_win,
        largest_loss,
        max_consecutive_wins,
        max_consecutive_losses,
        recovery_factor,
        market_condition_performance: condition_performance(trades),
        monthly_returns: monthly_returns(equity_curve),
    }
}

/// Per-candle returns from the equity curve.
pub fn equity_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .map(|w| {
            let e0 = w[0].equity.to_f64().unwrap_or(1.0);
            let e1 = w[1].equity.to_f64().unwrap_or(1.0);
            if e0 > 0.0 {
                e1 / e0 - 1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// CAGR over the run's calendar duration. Runs shorter than a day fall
/// back to counting candle periods against `periods_per_year`.
fn annualized_return(
    equity_curve: &[EquityPoint],
    initial: f64,
    final_equity: f64,
    total_candles: usize,
    periods_per_year: f64,
) -> f64 {
    if initial <= 0.0 || final_equity <= 0.0 || equity_curve.is_empty() {
        return 0.0;
    }
    let days = (equity_curve[equity_curve.len() - 1].timestamp - equity_curve[0].timestamp)
        .num_days();
    let mut years = days as f64 / 365.25;
    if years <= 0.0 && periods_per_year > 0.0 {
        years = total_candles as f64 / periods_per_year;
    }
    if years <= 0.0 {
        return 0.0;
    }
    let ratio = final_equity / initial;
    (ratio.powf(1.0 / years) - 1.0) * 100.0
}

/// Sharpe and Sortino, both 0.0 when their deviation denominator is zero.
fn risk_ratios(returns: &[f64], periods_per_year: f64) -> (f64, f64) {
    if returns.len() < 2 {
        return (0.0, 0.0);
    }
    let mean = returns.mean();
    let std_dev = returns.std_dev();
    let annualize = periods_per_year.max(0.0).sqrt();

    let sharpe = if std_dev > 0.0 {
        mean / std_dev * annualize
    } else {
        0.0
    };

    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    let sortino = if downside.is_empty() {
        0.0
    } else {
        let downside_dev =
            (downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64).sqrt();
        if downside_dev > 0.0 {
            mean / downside_dev * annualize
        } else {
            0.0
        }
    };

    (sharpe, sortino)
}

/// Longest run of consecutive candles spent below a prior equity peak.
fn longest_underwater_run(drawdown_curve: &[DrawdownPoint]) -> usize {
    let mut longest = 0usize;
    let mut current = 0usize;
    for point in drawdown_curve {
        if point.drawdown_percent < 0.0 {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

fn consecutive_streaks(trades: &[Trade]) -> (usize, usize) {
    let mut max_wins = 0;
    let mut max_losses = 0;
    let mut wins = 0;
    let mut losses = 0;
    for trade in trades {
        if trade.pnl > Decimal::ZERO {
            wins += 1;
            losses = 0;
            max_wins = max_wins.max(wins);
        } else if trade.pnl < Decimal::ZERO {
            losses += 1;
            wins = 0;
            max_losses = max_losses.max(losses);
        } else {
            wins = 0;
            losses = 0;
        }
    }
    (max_wins, max_losses)
}

/// Trades bucketed by the regime active when they were entered. Only
/// regimes that actually saw trades appear, in a fixed label order.
fn condition_performance(trades: &[Trade]) -> Vec<MarketConditionStats> {
    const ALL: [MarketCondition; 5] = [
        MarketCondition::Bullish,
        MarketCondition::Bearish,
        MarketCondition::Sideways,
        MarketCondition::Volatile,
        MarketCondition::LowVolatility,
    ];

    ALL.iter()
        .filter_map(|condition| {
            let bucket: Vec<&Trade> = trades
                .iter()
                .filter(|t| t.entry_condition == *condition)
                .collect();
            if bucket.is_empty() {
                return None;
            }
            let winning = bucket.iter().filter(|t| t.pnl > Decimal::ZERO).count();
            let total_return: f64 = bucket.iter().map(|t| t.pnl_percent).sum();
            Some(MarketConditionStats {
                condition: *condition,
                trades: bucket.len(),
                winning_trades: winning,
                win_rate: winning as f64 / bucket.len() as f64 * 100.0,
                total_return_percent: total_return,
                avg_return_percent: total_return / bucket.len() as f64,
            })
        })
        .collect()
}

/// Equity curve resampled to month-end percentage changes.
fn monthly_returns(equity_curve: &[EquityPoint]) -> Vec<MonthlyReturn> {
    let mut monthly = Vec::new();
    let first = match equity_curve.first() {
        Some(p) => p,
        None => return monthly,
    };

    let mut current_ym = (first.timestamp.year(), first.timestamp.month());
    let mut month_start = first.equity.to_f64().unwrap_or(1.0);
    let mut prev_equity = month_start;

    for point in equity_curve {
        let ym = (point.timestamp.year(), point.timestamp.month());
        if ym != current_ym {
            if month_start > 0.0 {
                monthly.push(MonthlyReturn {
                    year: current_ym.0,
                    month: current_ym.1,
                    return_percent: (prev_equity / month_start - 1.0) * 100.0,
                });
            }
            current_ym = ym;
            month_start = prev_equity;
        }
        prev_equity = point.equity.to_f64().unwrap_or(1.0);
    }

    if month_start > 0.0 {
        monthly.push(MonthlyReturn {
            year: current_ym.0,
            month: current_ym.1,
            return_percent: (prev_equity / month_start - 1.0) * 100.0,
        });
    }

    monthly
}
