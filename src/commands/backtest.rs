use crate::backtester::Backtester;
use crate::loader::{load_factor_spec, write_report};
use anyhow::Result;
use log::{info, warn};
use std::path::Path;

pub fn run(
    spec_path: &Path,
    prices_path: &Path,
    returns_path: Option<&Path>,
    settings_path: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    info!("Received backtest command for {}", spec_path.display());
    let spec = load_factor_spec(spec_path)?;
    let config = super::engine_config(settings_path)?;
    let panels = super::market_panels(prices_path, returns_path)?;

    let report = Backtester::new(&config).run(&spec, &panels)?;
    for failure in report.verdict.failures() {
        warn!(
            "Target {} missed: threshold {}, actual {}",
            failure.metric.as_str(),
            failure.threshold,
            failure
                .actual
                .map(|value| format!("{:.4}", value))
                .unwrap_or_else(|| "n/a".to_string())
        );
    }
    write_report(&report, output)?;
    if let Some(path) = output {
        info!("Report for {} written to {}", spec.name, path.display());
    }
    Ok(())
}
