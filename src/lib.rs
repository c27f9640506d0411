//! Factor evaluation and purged walk-forward backtesting.
//!
//! A [`models::FactorSpec`] declares signals in a small expression DSL, a
//! portfolio scheme and pass/fail targets. [`backtester::Backtester`] turns
//! it into out-of-sample portfolio returns, a metrics bundle and a verdict.

pub mod backtester;
pub mod commands;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod evaluator;
pub mod expression;
pub mod leakage;
pub mod loader;
pub mod metrics;
pub mod models;
pub mod panel;
pub mod portfolio;
pub mod primitives;
pub mod proposer;
pub mod splitter;
pub mod verdict;

pub use backtester::Backtester;
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use models::{BacktestReport, FactorSpec};
pub use panel::{MarketPanels, Panel};
