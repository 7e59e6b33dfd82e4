pub mod engine;
pub mod error;
pub mod market_condition;
pub mod metrics;
pub mod models;
pub mod monte_carlo;
pub mod sweep;

pub use engine::{CancelToken, SimulationEngine};
pub use error::BacktestError;
pub use market_condition::{MarketCondition, MarketConditionClassifier};
pub use metrics::compute_metrics;
pub use models::*;
pub use monte_carlo::run_monte_carlo;
pub use sweep::SweepRunner;
