use anyhow::{bail, Result};

use crate::models::*;

/// Prior used for a symbol pair with no entry in the correlation matrix.
/// Unknown correlation is not the same as zero correlation; assuming zero
/// would overstate diversification for untracked pairs.
pub const NEUTRAL_CORRELATION: f64 = 0.5;

/// Compute aggregate exposure and diversification metrics for a snapshot.
///
/// Per-position risk is each position's marked value as a percentage of
/// total portfolio value (cash included). The diversification score blends
/// value concentration with average pairwise correlation between held
/// symbols: 100 means many evenly-sized, uncorrelated positions, 0 means a
/// single position or perfectly correlated holdings.
pub fn assess_risk(
    snapshot: &PortfolioSnapshot,
    correlations: Option<&CorrelationMatrix>,
) -> Result<RiskAssessment> {
    let total_value = snapshot.total_value();
    if total_value <= 0.0 {
        bail!("portfolio has no value to assess");
    }

    let per_position_risk: Vec<PositionRisk> = snapshot
        .positions
        .iter()
        .map(|p| PositionRisk {
            symbol: p.symbol.clone(),
            value: p.current_value,
            risk_percent: p.current_value / total_value * 100.0,
        })
        .collect();

    let total_risk_percent = per_position_risk.iter().map(|p| p.risk_percent).sum();
    let max_position_risk_percent = per_position_risk
        .iter()
        .map(|p| p.risk_percent)
        .fold(0.0, f64::max);

    let herfindahl = concentration_index(snapshot);
    let risk_concentration_percent = herfindahl * 100.0;

    let diversification_score = if snapshot.positions.len() < 2 {
        0.0
    } else {
        let avg_corr = average_pairwise_correlation(snapshot, correlations);
        // Negative average correlation is clamped: hedging beyond
        // "uncorrelated" is not rewarded with extra score.
        let correlation_component = 1.0 - avg_corr.clamp(0.0, 1.0);
        ((1.0 - herfindahl) * correlation_component * 100.0).clamp(0.0, 100.0)
    };

    tracing::debug!(
        positions = snapshot.positions.len(),
        total_risk_percent,
        diversification_score,
        "portfolio risk assessed"
    );

    Ok(RiskAssessment {
        total_risk_percent,
        max_position_risk_percent,
        risk_concentration_percent,
        diversification_score,
        per_position_risk,
    })
}

/// Herfindahl index of position-value weights within invested capital.
fn concentration_index(snapshot: &PortfolioSnapshot) -> f64 {
    let invested = snapshot.invested_value();
    if invested <= 0.0 {
        return 0.0;
    }
    snapshot
        .positions
        .iter()
        .map(|p| {
            let w = p.current_value / invested;
            w * w
        })
        .sum()
}

fn average_pairwise_correlation(
    snapshot: &PortfolioSnapshot,
    correlations: Option<&CorrelationMatrix>,
) -> f64 {
    let symbols: Vec<&str> = snapshot.positions.iter().map(|p| p.symbol.as_str()).collect();
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for i in 0..symbols.len() {
        for j in (i + 1)..symbols.len() {
            let corr = correlations
                .and_then(|m| m.get(symbols[i], symbols[j]))
                .unwrap_or(NEUTRAL_CORRELATION);
            sum += corr;
            pairs += 1;
        }
    }
    if pairs == 0 {
        NEUTRAL_CORRELATION
    } else {
        sum / pairs as f64
    }
}

/// Pearson correlation of paired period returns.
///
/// Returns `None` when the series differ in length, hold fewer than three
/// points, or either return series has zero variance (a constant price
/// series has no defined correlation with anything).
pub fn correlation(series_a: &[f64], series_b: &[f64]) -> Option<f64> {
    if series_a.len() != series_b.len() || series_a.len() < 3 {
        return None;
    }
    let returns_a = period_returns(series_a)?;
    let returns_b = period_returns(series_b)?;

    let n = returns_a.len() as f64;
    let mean_a = returns_a.iter().sum::<f64>() / n;
    let mean_b = returns_b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (ra, rb) in returns_a.iter().zip(returns_b.iter()) {
        let da = ra - mean_a;
        let db = rb - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

/// Sample standard deviation of the trailing `lookback` period returns,
/// as a percentage.
///
/// The result is per-period and deliberately NOT annualized; callers that
/// want an annual figure apply [`annualized_volatility`] with their own
/// periods-per-year factor.
pub fn volatility(series: &[f64], lookback: usize) -> Option<f64> {
    if lookback < 2 || series.len() < lookback + 1 {
        return None;
    }
    let window = &series[series.len() - (lookback + 1)..];
    let returns = period_returns(window)?;

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt() * 100.0)
}

/// Scale a per-period volatility to an annual figure.
pub fn annualized_volatility(per_period_percent: f64, periods_per_year: f64) -> f64 {
    per_period_percent * periods_per_year.max(0.0).sqrt()
}

fn period_returns(prices: &[f64]) -> Option<Vec<f64>> {
    if prices.len() < 2 || prices.iter().any(|p| *p <= 0.0 || !p.is_finite()) {
        return None;
    }
    Some(prices.windows(2).map(|w| w[1] / w[0] - 1.0).collect())
}
