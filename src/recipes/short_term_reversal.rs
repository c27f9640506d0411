pub struct ShortTermReversal {
    template_id: String,
}

impl ShortTermReversal {
    pub fn new() -> Self {
        Self {
            template_id: "short_term_reversal".to_string(),
        }
    }
}

impl Default for ShortTermReversal {
    fn default() -> Self {
        Self::new()
    }
}

const TEMPLATE: &str = r#"
name: short_term_reversal
universe: us_equities
frequency: D
description: Losers of the past week against its winners
signals:
  - id: reversal
    expr: "-RET_LAG(1, ${window})"
    normalize: zscore
portfolio:
  scheme: long_short_quintiles
  weight: equal
  rebalance: W
  costs:
    bps_per_trade: 10
    borrow_bps: 50
validation:
  min_history_days: 300
  purge_gap_days: 10
targets:
  min_sharpe: 1.0
  max_maxdd: 0.30
  min_avg_ic: 0.02
"#;

const DEFAULTS: [(&str, f64); 1] = [("window", 5.0)];

impl super::FactorProposer for ShortTermReversal {
    fn template_id(&self) -> &str {
        &self.template_id
    }

    fn description(&self) -> &str {
        "Negative five-day return, quintile long/short, weekly rebalance"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    fn default_parameters(&self) -> &[(&'static str, f64)] {
        &DEFAULTS
    }
}
