use thiserror::Error;

/// Failure taxonomy for a backtest run.
///
/// Configuration and data problems are rejected before any candle is
/// processed; strategy failures and cancellation abort the run at a known
/// candle index. Numeric degeneracies (zero-loss profit factor, constant
/// series) are never errors — the metrics layer substitutes documented
/// sentinels and continues.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid price series: {0}")]
    InvalidSeries(String),

    #[error("insufficient data: {len} candles (need at least {required})")]
    InsufficientData { len: usize, required: usize },

    #[error("strategy failed at candle {index}: {message}")]
    Strategy { index: usize, message: String },

    #[error("run cancelled at candle {index}")]
    Cancelled { index: usize },
}
