use rayon::prelude::*;

use crate::engine::{CancelToken, SimulationEngine};
use crate::error::BacktestError;
use crate::models::{BacktestConfig, BacktestResult, PriceSeries, Strategy};

/// Runs a batch of configurations against one shared read-only series.
///
/// Runs are independent, so they fan out across the rayon pool with no
/// shared mutable state; each worker owns its engine instance. One cancel
/// token covers the whole sweep — cancelled runs come back as
/// `Err(Cancelled)` in their slot, already-finished runs keep their result.
pub struct SweepRunner;

impl SweepRunner {
    pub fn run<S>(
        series: &PriceSeries,
        strategy: &S,
        configs: Vec<BacktestConfig>,
        cancel: &CancelToken,
    ) -> Vec<Result<BacktestResult, BacktestError>>
    where
        S: Strategy + Sync,
    {
        tracing::info!(runs = configs.len(), "starting parameter sweep");
        configs
            .into_par_iter()
            .map(|config| {
                let engine = SimulationEngine::new(config)?;
                engine.run_with_cancel(series, strategy, cancel)
            })
            .collect()
    }
}
