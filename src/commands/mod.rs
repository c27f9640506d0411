pub mod backtest;
pub mod check;
pub mod recipe;
pub mod splits;

use crate::config::EngineConfig;
use crate::loader::{load_panel, load_settings};
use crate::panel::MarketPanels;
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

/// Engine defaults, overlaid with the settings file when one is given.
pub(crate) fn engine_config(settings: Option<&Path>) -> Result<EngineConfig> {
    match settings {
        Some(path) => {
            let settings = load_settings(path)?;
            info!("Loaded {} setting(s) from {}", settings.len(), path.display());
            EngineConfig::from_settings_map(&settings)
                .with_context(|| format!("invalid settings in {}", path.display()))
        }
        None => Ok(EngineConfig::default()),
    }
}

pub(crate) fn market_panels(prices: &Path, returns: Option<&Path>) -> Result<MarketPanels> {
    let prices = load_panel(prices)?;
    let returns = returns.map(load_panel).transpose()?;
    let panels = MarketPanels::new(prices, returns)?;
    info!(
        "Loaded panels: {} dates x {} instruments ({} to {})",
        panels.n_dates(),
        panels.prices().n_instruments(),
        panels.dates()[0],
        panels.dates()[panels.n_dates() - 1]
    );
    Ok(panels)
}
