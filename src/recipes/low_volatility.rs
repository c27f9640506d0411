/// Long the calmest names, short the most volatile.
pub struct LowVolatility {
    template_id: String,
}

impl LowVolatility {
    pub fn new() -> Self {
        Self {
            template_id: "low_volatility".to_string(),
        }
    }
}

impl Default for LowVolatility {
    fn default() -> Self {
        Self::new()
    }
}

const TEMPLATE: &str = r#"
name: low_volatility
universe: us_equities
frequency: D
description: Inverse trailing volatility
signals:
  - id: low_vol
    expr: "1 / (ROLL_STD(RET_D(1), ${vol_window}) + ${epsilon})"
    normalize: zscore_${zscore_window}
portfolio:
  scheme: long_short_deciles
  weight: equal
  rebalance: M
validation:
  min_history_days: 800
  purge_gap_days: 21
targets:
  min_sharpe: 1.0
  max_maxdd: 0.30
  min_avg_ic: 0.04
  max_turnover_monthly: 200
"#;

const DEFAULTS: [(&str, f64); 3] = [
    ("vol_window", 63.0),
    ("epsilon", 0.001),
    ("zscore_window", 252.0),
];

impl super::FactorProposer for LowVolatility {
    fn template_id(&self) -> &str {
        &self.template_id
    }

    fn description(&self) -> &str {
        "Inverse 63-day volatility, rolling z-scored"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    fn default_parameters(&self) -> &[(&'static str, f64)] {
        &DEFAULTS
    }
}
