use crate::backtester::Backtester;
use crate::config::EngineConfig;
use crate::loader::load_factor_spec;
use anyhow::Result;
use log::info;
use std::path::Path;

/// Static validation only: expressions, references and lags.
pub fn run(spec_path: &Path) -> Result<()> {
    let spec = load_factor_spec(spec_path)?;
    let config = EngineConfig::default();
    let audit = Backtester::new(&config).check_spec(&spec)?;

    for (id, profile) in &audit.profiles {
        match profile.min_lag {
            Some(lag) => info!(
                "Signal {}: min lag {}, lookback {}",
                id, lag, profile.lookback
            ),
            None => info!("Signal {}: reads no market data", id),
        }
    }
    info!(
        "Factor {} is leak-free: {} signal(s), max lookback {}, complexity {:.2}",
        spec.name,
        audit.profiles.len(),
        audit.max_lookback,
        audit.complexity
    );
    Ok(())
}
