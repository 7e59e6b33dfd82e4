pub mod calculator;
pub mod models;

pub use calculator::{
    annualized_volatility, assess_risk, correlation, volatility, NEUTRAL_CORRELATION,
};
pub use models::*;
