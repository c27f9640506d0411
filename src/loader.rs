use crate::models::{BacktestReport, FactorSpec};
use crate::panel::{Panel, PanelFrame};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Reads a factor spec from YAML, or JSON when the file ends in `.json`.
pub fn load_factor_spec(path: &Path) -> Result<FactorSpec> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read factor spec from {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let spec = if is_json {
        let spec: FactorSpec = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse factor spec JSON from {}", path.display()))?;
        spec.validate()?;
        spec
    } else {
        FactorSpec::from_yaml(&text)
            .with_context(|| format!("invalid factor spec in {}", path.display()))?
    };
    Ok(spec)
}

/// Reads a `{dates, instruments, values}` panel; `null` marks a missing value.
pub fn load_panel(path: &Path) -> Result<Panel> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read panel from {}", path.display()))?;
    let frame: PanelFrame = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse panel JSON from {}", path.display()))?;
    Panel::from_frame(frame).with_context(|| format!("invalid panel in {}", path.display()))
}

/// Reads a flat JSON object of settings. Numbers and booleans are accepted
/// and kept in their textual form.
pub fn load_settings(path: &Path) -> Result<HashMap<String, String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings from {}", path.display()))?;
    let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse settings JSON from {}", path.display()))?;

    let mut settings = HashMap::with_capacity(raw.len());
    for (key, value) in raw {
        let text = match value {
            serde_json::Value::String(text) => text,
            serde_json::Value::Number(number) => number.to_string(),
            serde_json::Value::Bool(flag) => flag.to_string(),
            serde_json::Value::Null => continue,
            other => {
                return Err(anyhow!(
                    "Setting {} must be a string, number or boolean (value: {})",
                    key,
                    other
                ))
            }
        };
        settings.insert(key, text);
    }
    Ok(settings)
}

pub fn write_report(report: &BacktestReport, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to serialize backtest report")?;
    match path {
        Some(path) => fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display())),
        None => {
            println!("{}", json);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("factor-engine-loader-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn panel_nulls_become_missing() {
        let path = scratch_file(
            "prices.json",
            r#"{"dates": ["2024-01-02", "2024-01-03"],
                "instruments": ["AAA", "BBB"],
                "values": [[10.0, null], [10.5, 20.0]]}"#,
        );
        let panel = load_panel(&path).unwrap();
        assert_eq!(panel.n_dates(), 2);
        assert!(panel.value(0, 1).is_nan());
        assert_eq!(panel.get(1, 0), Some(10.5));
    }

    #[test]
    fn ragged_panel_is_rejected() {
        let path = scratch_file(
            "ragged.json",
            r#"{"dates": ["2024-01-02"], "instruments": ["AAA", "BBB"], "values": [[1.0]]}"#,
        );
        let err = load_panel(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("row 0 has 1 values"));
    }

    #[test]
    fn settings_accept_scalars() {
        let path = scratch_file(
            "settings.json",
            r#"{"WALK_FORWARD_SPLITS": 3, "IC_METHOD": "pearson", "PARALLEL_SPLITS": false, "UNUSED": null}"#,
        );
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.get("WALK_FORWARD_SPLITS").map(String::as_str), Some("3"));
        assert_eq!(settings.get("PARALLEL_SPLITS").map(String::as_str), Some("false"));
        assert!(!settings.contains_key("UNUSED"));
    }

    #[test]
    fn spec_loads_from_yaml_and_json() {
        let yaml = scratch_file(
            "factor.yaml",
            "name: reversal\nsignals:\n  - id: rev\n    expr: \"-RET_LAG(1, 5)\"\n",
        );
        let spec = load_factor_spec(&yaml).unwrap();
        assert_eq!(spec.signals[0].id, "rev");

        let json = scratch_file(
            "factor.json",
            r#"{"name": "reversal", "signals": [{"id": "rev", "expr": "-RET_LAG(1, 5)"}]}"#,
        );
        let spec = load_factor_spec(&json).unwrap();
        assert_eq!(spec.portfolio.notional, 1.0);
    }
}
