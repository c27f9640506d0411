use crate::diagnostics::Diagnostic;
use crate::error::{EngineError, EngineResult};
use crate::verdict::Verdict;
use anyhow::{anyhow, Result as AnyResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Frequency {
    #[default]
    #[serde(rename = "D", alias = "d", alias = "daily")]
    Daily,
    #[serde(rename = "W", alias = "w", alias = "weekly")]
    Weekly,
    #[serde(rename = "M", alias = "m", alias = "monthly")]
    Monthly,
}

impl Frequency {
    pub fn periods_per_year(self) -> f64 {
        match self {
            Self::Daily => 252.0,
            Self::Weekly => 52.0,
            Self::Monthly => 12.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "D",
            Self::Weekly => "W",
            Self::Monthly => "M",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortfolioScheme {
    #[default]
    LongShortDeciles,
    LongShortQuintiles,
    RankWeighted,
}

impl PortfolioScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LongShortDeciles => "long_short_deciles",
            Self::LongShortQuintiles => "long_short_quintiles",
            Self::RankWeighted => "rank_weighted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegWeighting {
    #[default]
    Equal,
    ScoreWeighted,
}

/// How several declared signals collapse into the one that gets traded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCombine {
    #[default]
    Last,
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    None,
    ZScore,
    Rank,
    Demean,
    RollingZScore(usize),
}

impl Normalization {
    pub fn parse(raw: Option<&str>) -> AnyResult<Self> {
        let Some(raw) = raw else {
            return Ok(Self::None);
        };
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "" | "none" => Ok(Self::None),
            "zscore" | "cs_zscore" => Ok(Self::ZScore),
            "rank" | "cs_rank" => Ok(Self::Rank),
            "demean" => Ok(Self::Demean),
            other => {
                let window = other
                    .strip_prefix("zscore_")
                    .and_then(|suffix| suffix.parse::<usize>().ok())
                    .filter(|window| *window >= 2)
                    .ok_or_else(|| {
                        anyhow!(
                            "normalize must be none, zscore, rank, demean or zscore_<window> (value: {})",
                            raw
                        )
                    })?;
                Ok(Self::RollingZScore(window))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDef {
    pub id: String,
    pub expr: String,
    #[serde(default)]
    pub normalize: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostsDef {
    pub bps_per_trade: f64,
    pub borrow_bps: f64,
}

impl Default for CostsDef {
    fn default() -> Self {
        Self {
            bps_per_trade: 5.0,
            borrow_bps: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioDef {
    pub scheme: PortfolioScheme,
    pub weight: LegWeighting,
    pub rebalance: Frequency,
    pub notional: f64,
    pub costs: CostsDef,
    pub signal: Option<String>,
    pub combine: SignalCombine,
}

impl Default for PortfolioDef {
    fn default() -> Self {
        Self {
            scheme: PortfolioScheme::default(),
            weight: LegWeighting::default(),
            rebalance: Frequency::Monthly,
            notional: 1.0,
            costs: CostsDef::default(),
            signal: None,
            combine: SignalCombine::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationDef {
    pub min_history_days: usize,
    pub purge_gap_days: usize,
    pub n_splits: Option<usize>,
}

impl Default for ValidationDef {
    fn default() -> Self {
        Self {
            min_history_days: 800,
            purge_gap_days: 21,
            n_splits: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsDef {
    pub min_sharpe: Option<f64>,
    pub max_maxdd: Option<f64>,
    pub min_avg_ic: Option<f64>,
    pub min_ir: Option<f64>,
    pub min_hit_rate: Option<f64>,
    pub max_turnover_monthly: Option<f64>,
}

impl Default for TargetsDef {
    fn default() -> Self {
        Self {
            min_sharpe: Some(1.8),
            max_maxdd: Some(0.25),
            min_avg_ic: Some(0.05),
            min_ir: None,
            min_hit_rate: None,
            max_turnover_monthly: None,
        }
    }
}

fn default_universe() -> String {
    "default".to_string()
}

/// Declarative description of one factor. Read-only once parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorSpec {
    pub name: String,
    #[serde(default = "default_universe")]
    pub universe: String,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default)]
    pub description: Option<String>,
    pub signals: Vec<SignalDef>,
    #[serde(default)]
    pub portfolio: PortfolioDef,
    #[serde(default)]
    pub validation: ValidationDef,
    #[serde(default)]
    pub targets: TargetsDef,
}

impl FactorSpec {
    pub fn from_yaml(text: &str) -> EngineResult<Self> {
        let spec: FactorSpec = serde_yaml::from_str(text).map_err(|err| {
            EngineError::configuration(format!("failed to parse factor spec: {}", err))
        })?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_yaml(&self) -> EngineResult<String> {
        serde_yaml::to_string(self).map_err(|err| {
            EngineError::configuration(format!("failed to serialize factor spec: {}", err))
        })
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::configuration("factor name must not be empty"));
        }
        if self.signals.is_empty() {
            return Err(EngineError::configuration(format!(
                "factor {} declares no signals",
                self.name
            )));
        }

        let mut ids = HashSet::new();
        for signal in &self.signals {
            if signal.id.trim().is_empty() {
                return Err(EngineError::configuration(format!(
                    "factor {} has a signal with an empty id",
                    self.name
                )));
            }
            if !ids.insert(signal.id.as_str()) {
                return Err(EngineError::configuration(format!(
                    "signal id {} is declared more than once",
                    signal.id
                )));
            }
            Normalization::parse(signal.normalize.as_deref()).map_err(|err| {
                EngineError::SignalConfiguration {
                    signal_id: signal.id.clone(),
                    expr: signal.expr.clone(),
                    reason: err.to_string(),
                }
            })?;
        }

        let portfolio = &self.portfolio;
        if !(portfolio.notional.is_finite() && portfolio.notional > 0.0) {
            return Err(EngineError::configuration(format!(
                "portfolio notional must be > 0 (value: {})",
                portfolio.notional
            )));
        }
        for (key, value) in [
            ("bps_per_trade", portfolio.costs.bps_per_trade),
            ("borrow_bps", portfolio.costs.borrow_bps),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(EngineError::configuration(format!(
                    "costs.{} must be >= 0 (value: {})",
                    key, value
                )));
            }
        }
        if let Some(traded) = &portfolio.signal {
            if !ids.contains(traded.as_str()) {
                return Err(EngineError::configuration(format!(
                    "portfolio.signal {} does not name a declared signal",
                    traded
                )));
            }
        }

        let validation = &self.validation;
        if validation.purge_gap_days > validation.min_history_days {
            return Err(EngineError::configuration(format!(
                "purge_gap_days ({}) must be <= min_history_days ({})",
                validation.purge_gap_days, validation.min_history_days
            )));
        }
        if validation.n_splits == Some(0) {
            return Err(EngineError::configuration("n_splits must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatedValue {
    pub date: NaiveDate,
    pub value: f64,
}

/// Realized return of the book on one date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioReturn {
    pub date: NaiveDate,
    pub gross: f64,
    pub cost: f64,
    pub net: f64,
    pub turnover: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioReturns {
    pub records: Vec<PortfolioReturn>,
}

impl PortfolioReturns {
    pub fn net(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.net).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_cost(&self) -> f64 {
        self.records.iter().map(|r| r.cost).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitWindow {
    pub index: usize,
    pub train: Range<usize>,
    pub embargo: Range<usize>,
    pub test: Range<usize>,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SplitOutcome {
    Completed {
        days: usize,
        sharpe: f64,
        avg_ic: f64,
        rebalances: usize,
        missing_return_days: usize,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitReport {
    pub window: SplitWindow,
    pub outcome: SplitOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreMetrics {
    pub sharpe: f64,
    pub ann_ret: f64,
    pub ann_vol: f64,
    pub maxdd: f64,
    pub avg_ic: f64,
    pub ic_std: f64,
    pub ir: f64,
    pub hit_rate: f64,
    pub turnover_monthly: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub skew: f64,
    pub kurtosis: f64,
    pub days: usize,
    pub ic_days: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub var_95: f64,
    pub cvar_95: f64,
    pub tail_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawdownProfile {
    pub max_drawdown: f64,
    pub avg_drawdown: f64,
    pub longest_duration_days: usize,
    pub recovery_days: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StabilityMetrics {
    pub rolling_sharpe: Vec<DatedValue>,
    pub rolling_ic: Vec<DatedValue>,
    pub split_sharpe_mean: f64,
    pub split_sharpe_std: f64,
    pub split_ic_mean: f64,
    pub split_ic_std: f64,
    pub rolling_sharpe_drawdown: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeStats {
    pub days: usize,
    pub sharpe: f64,
    pub ann_ret: f64,
    pub avg_ic: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeBreakdown {
    pub bull: RegimeStats,
    pub bear: RegimeStats,
    pub high_vol: RegimeStats,
    pub low_vol: RegimeStats,
    pub robustness: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecayDiagnostics {
    pub early_sharpe: f64,
    pub late_sharpe: f64,
    pub sharpe_decay_rate: f64,
    pub early_ic: f64,
    pub late_ic: f64,
    pub ic_decay_rate: f64,
    pub ic_half_life: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsBundle {
    pub core: CoreMetrics,
    pub risk: RiskMetrics,
    pub drawdown: DrawdownProfile,
    pub stability: StabilityMetrics,
    pub regimes: RegimeBreakdown,
    pub decay: DecayDiagnostics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSummary {
    pub id: String,
    pub min_lag: Option<usize>,
    pub lookback: usize,
    pub same_day_correlation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub factor_name: String,
    pub universe: String,
    pub signals: Vec<SignalSummary>,
    pub complexity: f64,
    pub embargo_days: usize,
    pub splits: Vec<SplitReport>,
    pub returns: PortfolioReturns,
    pub metrics: MetricsBundle,
    pub verdict: Verdict,
    pub diagnostics: Vec<Diagnostic>,
}

impl BacktestReport {
    pub fn completed_splits(&self) -> usize {
        self.splits
            .iter()
            .filter(|split| matches!(split.outcome, SplitOutcome::Completed { .. }))
            .count()
    }

    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TSMOM_YAML: &str = r#"
name: tsmom_12_1
universe: us_equities
frequency: D
signals:
  - id: mom
    expr: "RET_LAG(1,252) - RET_LAG(1,21)"
    normalize: zscore
portfolio:
  scheme: long_short_deciles
  weight: equal
  rebalance: M
  costs:
    bps_per_trade: 5
    borrow_bps: 50
validation:
  min_history_days: 800
  purge_gap_days: 21
targets:
  min_sharpe: 1.8
  max_maxdd: 0.25
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let spec = FactorSpec::from_yaml(TSMOM_YAML).unwrap();
        assert_eq!(spec.name, "tsmom_12_1");
        assert_eq!(spec.frequency, Frequency::Daily);
        assert_eq!(spec.portfolio.rebalance, Frequency::Monthly);
        assert_eq!(spec.portfolio.notional, 1.0);
        assert_eq!(spec.targets.min_sharpe, Some(1.8));
        assert_eq!(spec.targets.min_avg_ic, Some(0.05));
        assert_eq!(spec.targets.min_ir, None);
        assert_eq!(spec.validation.n_splits, None);
    }

    #[test]
    fn rejects_duplicate_signal_ids() {
        let text = r#"
name: dup
signals:
  - id: a
    expr: "RET_LAG(1,5)"
  - id: a
    expr: "RET_LAG(1,10)"
"#;
        let err = FactorSpec::from_yaml(text).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_unknown_normalization_naming_signal() {
        let text = r#"
name: bad_norm
signals:
  - id: a
    expr: "RET_LAG(1,5)"
    normalize: softmax
"#;
        match FactorSpec::from_yaml(text).unwrap_err() {
            EngineError::SignalConfiguration { signal_id, .. } => assert_eq!(signal_id, "a"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_traded_signal_that_is_not_declared() {
        let text = r#"
name: bad_ref
signals:
  - id: a
    expr: "RET_LAG(1,5)"
portfolio:
  signal: b
"#;
        assert!(FactorSpec::from_yaml(text).is_err());
    }

    #[test]
    fn normalization_accepts_rolling_window_suffix() {
        assert_eq!(
            Normalization::parse(Some("zscore_252")).unwrap(),
            Normalization::RollingZScore(252)
        );
        assert_eq!(Normalization::parse(None).unwrap(), Normalization::None);
        assert!(Normalization::parse(Some("zscore_1")).is_err());
    }
}
