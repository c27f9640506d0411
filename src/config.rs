use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IcMethod {
    #[default]
    Spearman,
    Pearson,
}

impl IcMethod {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "spearman" | "rank" => Ok(Self::Spearman),
            "pearson" => Ok(Self::Pearson),
            other => Err(anyhow!(
                "IC_METHOD must be SPEARMAN or PEARSON (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Spearman => "rank IC",
            Self::Pearson => "Pearson IC",
        }
    }
}

/// Knobs shared by every stage of one backtest invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    // Leakage and numerics
    pub leakage_correlation_threshold: f64,
    pub volatility_epsilon: f64,

    // Walk-forward
    pub walk_forward_splits: usize,
    pub min_test_days: usize,
    pub extend_embargo_to_lookback: bool,
    pub parallel_splits: bool,

    // Portfolio
    pub decile_fraction: f64,
    pub max_gross_leverage: f64,
    pub max_single_position: Option<f64>,

    // Metrics
    pub ic_method: IcMethod,
    pub periods_per_year: Option<f64>,
    pub risk_free_rate: f64,
    pub rolling_sharpe_window: usize,
    pub rolling_ic_window: usize,
    pub stability_window: usize,
    pub max_sharpe_drawdown: f64,

    // Regimes and decay
    pub regime_trend_window: usize,
    pub regime_vol_window: usize,
    pub min_regime_days: usize,
    pub min_regime_sharpe: f64,
    pub decay_alert_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            leakage_correlation_threshold: 0.3,
            volatility_epsilon: 0.001,
            walk_forward_splits: 5,
            min_test_days: 63,
            extend_embargo_to_lookback: true,
            parallel_splits: true,
            decile_fraction: 0.1,
            max_gross_leverage: 2.0,
            max_single_position: None,
            ic_method: IcMethod::Spearman,
            periods_per_year: None,
            risk_free_rate: 0.0,
            rolling_sharpe_window: 63,
            rolling_ic_window: 21,
            stability_window: 252,
            max_sharpe_drawdown: 0.5,
            regime_trend_window: 63,
            regime_vol_window: 21,
            min_regime_days: 63,
            min_regime_sharpe: 0.5,
            decay_alert_threshold: 0.2,
        }
    }
}

impl EngineConfig {
    /// Overlays upper-case settings onto the defaults. Absent keys keep their
    /// default; present keys must parse and sit inside their range.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let leakage_correlation_threshold = optional_setting_f64(
            settings,
            "LEAKAGE_CORRELATION_THRESHOLD",
            Some(0.0),
            Some(1.0),
        )?
        .unwrap_or(defaults.leakage_correlation_threshold);
        let volatility_epsilon =
            optional_setting_f64(settings, "VOLATILITY_EPSILON", Some(0.0), None)?
                .unwrap_or(defaults.volatility_epsilon);
        let walk_forward_splits = optional_setting_usize(settings, "WALK_FORWARD_SPLITS", 1)?
            .unwrap_or(defaults.walk_forward_splits);
        let min_test_days = optional_setting_usize(settings, "MIN_TEST_DAYS", 1)?
            .unwrap_or(defaults.min_test_days);
        let extend_embargo_to_lookback =
            optional_setting_bool(settings, "EXTEND_EMBARGO_TO_LOOKBACK")?
                .unwrap_or(defaults.extend_embargo_to_lookback);
        let parallel_splits = optional_setting_bool(settings, "PARALLEL_SPLITS")?
            .unwrap_or(defaults.parallel_splits);
        let decile_fraction =
            optional_setting_f64(settings, "DECILE_FRACTION", Some(0.01), Some(0.5))?
                .unwrap_or(defaults.decile_fraction);
        let max_gross_leverage =
            optional_setting_f64(settings, "MAX_GROSS_LEVERAGE", Some(0.0), None)?
                .unwrap_or(defaults.max_gross_leverage);
        let max_single_position =
            optional_setting_f64(settings, "MAX_SINGLE_POSITION", Some(0.0), Some(1.0))?
                .or(defaults.max_single_position);
        let ic_method = match setting(settings, "IC_METHOD") {
            Some(raw) => IcMethod::parse(raw)?,
            None => defaults.ic_method,
        };
        let periods_per_year =
            optional_setting_f64(settings, "PERIODS_PER_YEAR", Some(1.0), None)?
                .or(defaults.periods_per_year);
        let risk_free_rate = optional_setting_f64(settings, "RISK_FREE_RATE", None, None)?
            .unwrap_or(defaults.risk_free_rate);
        let rolling_sharpe_window = optional_setting_usize(settings, "ROLLING_SHARPE_WINDOW", 2)?
            .unwrap_or(defaults.rolling_sharpe_window);
        let rolling_ic_window = optional_setting_usize(settings, "ROLLING_IC_WINDOW", 1)?
            .unwrap_or(defaults.rolling_ic_window);
        let stability_window = optional_setting_usize(settings, "STABILITY_WINDOW", 2)?
            .unwrap_or(defaults.stability_window);
        let max_sharpe_drawdown =
            optional_setting_f64(settings, "MAX_SHARPE_DRAWDOWN", Some(0.0), Some(1.0))?
                .unwrap_or(defaults.max_sharpe_drawdown);
        let regime_trend_window = optional_setting_usize(settings, "REGIME_TREND_WINDOW", 1)?
            .unwrap_or(defaults.regime_trend_window);
        let regime_vol_window = optional_setting_usize(settings, "REGIME_VOL_WINDOW", 2)?
            .unwrap_or(defaults.regime_vol_window);
        let min_regime_days = optional_setting_usize(settings, "MIN_REGIME_DAYS", 1)?
            .unwrap_or(defaults.min_regime_days);
        let min_regime_sharpe = optional_setting_f64(settings, "MIN_REGIME_SHARPE", None, None)?
            .unwrap_or(defaults.min_regime_sharpe);
        let decay_alert_threshold =
            optional_setting_f64(settings, "DECAY_ALERT_THRESHOLD", Some(0.0), None)?
                .unwrap_or(defaults.decay_alert_threshold);

        Ok(Self {
            leakage_correlation_threshold,
            volatility_epsilon,
            walk_forward_splits,
            min_test_days,
            extend_embargo_to_lookback,
            parallel_splits,
            decile_fraction,
            max_gross_leverage,
            max_single_position,
            ic_method,
            periods_per_year,
            risk_free_rate,
            rolling_sharpe_window,
            rolling_ic_window,
            stability_window,
            max_sharpe_drawdown,
            regime_trend_window,
            regime_vol_window,
            min_regime_days,
            min_regime_sharpe,
            decay_alert_threshold,
        })
    }

    /// Annualization factor: explicit override, else the factor's native frequency.
    pub fn annualization(&self, native_periods_per_year: f64) -> f64 {
        self.periods_per_year.unwrap_or(native_periods_per_year)
    }
}

fn setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<Option<f64>> {
    let Some(raw) = setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(Some(value))
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<Option<usize>> {
    let Some(raw) = setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(Some(value as usize))
}

fn optional_setting_bool(settings: &HashMap<String, String>, key: &str) -> Result<Option<bool>> {
    let Some(raw) = setting(settings, key) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(anyhow!(
            "Setting {} must be true or false (value: {})",
            key,
            raw
        )),
    }
}
