use crate::backtester::Backtester;
use crate::loader::load_factor_spec;
use anyhow::Result;
use log::info;
use std::path::Path;

pub fn run(spec_path: &Path, prices_path: &Path, settings_path: Option<&Path>) -> Result<()> {
    let spec = load_factor_spec(spec_path)?;
    let config = super::engine_config(settings_path)?;
    let panels = super::market_panels(prices_path, None)?;

    let plan = Backtester::new(&config).plan_splits(&spec, &panels)?;
    for finding in &plan.diagnostics {
        finding.log();
    }
    info!(
        "{} split(s) for {}, embargo {} days",
        plan.splits.len(),
        spec.name,
        plan.embargo_days
    );
    for split in &plan.splits {
        let window = split.window(panels.dates());
        println!(
            "split {}: train {} to {} ({} days), embargo {} days, test {} to {} ({} days)",
            window.index,
            window.train_start,
            window.train_end,
            split.train.len(),
            split.embargo.len(),
            window.test_start,
            window.test_end,
            split.test.len()
        );
    }
    Ok(())
}
