//! Application Services
//!
//! - `PortfolioBuilder`: compiles risk files into portfolios
//! - `RiskModel`: market state, portfolios and the recompute pass

mod portfolio_builder;
mod risk_model;

pub use portfolio_builder::PortfolioBuilder;
pub use risk_model::{DEFAULT_HISTORY_LIMIT, HistoryLookup, RiskModel};
