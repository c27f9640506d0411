/// Cross-sectional 12-1 momentum, volatility targeted.
pub struct TimeSeriesMomentum {
    template_id: String,
}

impl TimeSeriesMomentum {
    pub fn new() -> Self {
        Self {
            template_id: "tsmom".to_string(),
        }
    }
}

impl Default for TimeSeriesMomentum {
    fn default() -> Self {
        Self::new()
    }
}

const TEMPLATE: &str = r#"
name: tsmom_12_1
universe: us_equities
frequency: D
description: Twelve month momentum skipping the latest month, scaled to a volatility target
signals:
  - id: mom_long
    expr: "RET_LAG(1, ${lookback}) - RET_LAG(1, ${skip})"
    normalize: zscore_${zscore_window}
  - id: vol
    expr: "ROLL_STD(RET_D(1), ${vol_window})"
  - id: risk_target
    expr: "VOL_TARGET(mom_long, ann_vol=${ann_vol}, using='vol')"
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
  min_sharpe: 1.0
  max_maxdd: 0.35
  min_avg_ic: 0.05
  max_turnover_monthly: 250
"#;

const DEFAULTS: [(&str, f64); 5] = [
    ("lookback", 252.0),
    ("skip", 21.0),
    ("zscore_window", 252.0),
    ("vol_window", 63.0),
    ("ann_vol", 0.15),
];

impl super::FactorProposer for TimeSeriesMomentum {
    fn template_id(&self) -> &str {
        &self.template_id
    }

    fn description(&self) -> &str {
        "12-1 momentum with a rolling z-score, volatility targeted to 15% annualised"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    fn default_parameters(&self) -> &[(&'static str, f64)] {
        &DEFAULTS
    }
}
