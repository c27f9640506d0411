/// Six month momentum per unit of trailing volatility.
pub struct VolScaledMomentum {
    template_id: String,
}

impl VolScaledMomentum {
    pub fn new() -> Self {
        Self {
            template_id: "vol_scaled_momentum".to_string(),
        }
    }
}

impl Default for VolScaledMomentum {
    fn default() -> Self {
        Self::new()
    }
}

const TEMPLATE: &str = r#"
name: vol_scaled_momentum
universe: us_equities
frequency: D
description: Momentum divided by trailing volatility
signals:
  - id: momentum
    expr: "RET_LAG(1, ${lookback}) - RET_LAG(1, ${skip})"
  - id: volatility
    expr: "ROLL_STD(RET_D(1), ${vol_window})"
  - id: scaled
    expr: "momentum / (volatility + ${epsilon})"
    normalize: zscore_${zscore_window}
portfolio:
  scheme: long_short_deciles
  weight: score_weighted
  rebalance: M
validation:
  min_history_days: 800
  purge_gap_days: 21
targets:
  min_sharpe: 1.2
  max_maxdd: 0.35
  min_avg_ic: 0.06
  max_turnover_monthly: 250
"#;

const DEFAULTS: [(&str, f64); 5] = [
    ("lookback", 126.0),
    ("skip", 21.0),
    ("vol_window", 63.0),
    ("epsilon", 0.001),
    ("zscore_window", 252.0),
];

impl super::FactorProposer for VolScaledMomentum {
    fn template_id(&self) -> &str {
        &self.template_id
    }

    fn description(&self) -> &str {
        "126-1 momentum over 63-day volatility, score weighted deciles"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    fn default_parameters(&self) -> &[(&'static str, f64)] {
        &DEFAULTS
    }
}
