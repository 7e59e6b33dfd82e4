use rand::Rng;
use rayon::prelude::*;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::models::{MonteCarloResult, Trade};

/// Equity fraction below which a resampled path counts as ruined.
const RUIN_THRESHOLD: f64 = 0.5;

/// Bootstrap-resample a finished run's trade sequence to estimate how
/// sensitive the result is to trade ordering and selection.
///
/// Each simulation draws `trades.len()` per-trade returns with replacement
/// and replays them against `initial_capital`, producing a distribution of
/// final returns and max drawdowns. Zero trades or zero simulations yield
/// an empty result rather than an error.
pub fn run_monte_carlo(
    trades: &[Trade],
    initial_capital: Decimal,
    num_simulations: usize,
) -> MonteCarloResult {
    if trades.is_empty() || num_simulations == 0 {
        return MonteCarloResult {
            simulations: 0,
            median_return_percent: 0.0,
            mean_return_percent: 0.0,
            std_dev_return_percent: 0.0,
            percentile_5: 0.0,
            percentile_25: 0.0,
            percentile_75: 0.0,
            percentile_95: 0.0,
            probability_of_profit: 0.0,
            probability_of_ruin: 0.0,
            median_max_drawdown_percent: 0.0,
        };
    }

    let trade_fractions: Vec<f64> = trades.iter().map(|t| t.pnl_percent / 100.0).collect();
    let n_trades = trade_fractions.len();
    let initial = initial_capital.to_f64().unwrap_or(100_000.0);

    let outcomes: Vec<(f64, f64)> = (0..num_simulations)
        .into_par_iter()
        .map(|_| {
            let mut rng = rand::thread_rng();
            let mut equity = initial;
            let mut peak = initial;
            let mut max_drawdown = 0.0_f64;
            let mut ruined = false;

            for _ in 0..n_trades {
                let r = trade_fractions[rng.gen_range(0..n_trades)];
                equity *= 1.0 + r;
                if equity <= 0.0 {
                    equity = 0.0;
                    ruined = true;
                    break;
                }
                if equity > peak {
                    peak = equity;
                }
                let dd = (peak - equity) / peak * 100.0;
                if dd > max_drawdown {
                    max_drawdown = dd;
                }
            }
            if ruined {
                max_drawdown = 100.0;
            }

            let final_return = (equity / initial - 1.0) * 100.0;
            (final_return, max_drawdown)
        })
        .collect();

    let mut returns: Vec<f64> = outcomes.iter().map(|o| o.0).collect();
    let mut drawdowns: Vec<f64> = outcomes.iter().map(|o| o.1).collect();
    returns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    drawdowns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let profitable = returns.iter().filter(|r| **r > 0.0).count();
    let ruined = returns
        .iter()
        .filter(|r| **r <= (RUIN_THRESHOLD - 1.0) * 100.0)
        .count();

    MonteCarloResult {
        simulations: num_simulations,
        median_return_percent: percentile_sorted(&returns, 50.0),
        mean_return_percent: mean,
        std_dev_return_percent: variance.sqrt(),
        percentile_5: percentile_sorted(&returns, 5.0),
        percentile_25: percentile_sorted(&returns, 25.0),
        percentile_75: percentile_sorted(&returns, 75.0),
        percentile_95: percentile_sorted(&returns, 95.0),
        probability_of_profit: profitable as f64 / n,
        probability_of_ruin: ruined as f64 / n,
        median_max_drawdown_percent: percentile_sorted(&drawdowns, 50.0),
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
