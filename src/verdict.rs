use crate::models::{CoreMetrics, TargetsDef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    Sharpe,
    #[serde(rename = "maxdd")]
    MaxDrawdown,
    AvgIc,
    Ir,
    HitRate,
    TurnoverMonthly,
}

impl TargetMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sharpe => "sharpe",
            Self::MaxDrawdown => "maxdd",
            Self::AvgIc => "avg_ic",
            Self::Ir => "ir",
            Self::HitRate => "hit_rate",
            Self::TurnoverMonthly => "turnover_monthly",
        }
    }

    /// Upper-bound targets pass at or below the threshold.
    fn is_ceiling(self) -> bool {
        matches!(self, Self::MaxDrawdown | Self::TurnoverMonthly)
    }

    fn actual(self, core: &CoreMetrics) -> f64 {
        match self {
            Self::Sharpe => core.sharpe,
            Self::MaxDrawdown => core.maxdd.abs(),
            Self::AvgIc => core.avg_ic,
            Self::Ir => core.ir,
            Self::HitRate => core.hit_rate,
            Self::TurnoverMonthly => core.turnover_monthly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCheck {
    pub metric: TargetMetric,
    pub threshold: f64,
    /// `None` when nothing was scored.
    pub actual: Option<f64>,
    pub status: TargetStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub checks: Vec<TargetCheck>,
    pub overall: TargetStatus,
}

fn configured_targets(targets: &TargetsDef) -> Vec<(TargetMetric, f64)> {
    [
        (TargetMetric::Sharpe, targets.min_sharpe),
        (TargetMetric::MaxDrawdown, targets.max_maxdd),
        (TargetMetric::AvgIc, targets.min_avg_ic),
        (TargetMetric::Ir, targets.min_ir),
        (TargetMetric::HitRate, targets.min_hit_rate),
        (TargetMetric::TurnoverMonthly, targets.max_turnover_monthly),
    ]
    .into_iter()
    .filter_map(|(metric, threshold)| threshold.map(|threshold| (metric, threshold)))
    .collect()
}

impl Verdict {
    pub fn evaluate(targets: &TargetsDef, core: &CoreMetrics) -> Self {
        let checks = configured_targets(targets)
            .into_iter()
            .map(|(metric, threshold)| {
                let actual = metric.actual(core);
                let passed = if metric.is_ceiling() {
                    actual <= threshold
                } else {
                    actual >= threshold
                };
                TargetCheck {
                    metric,
                    threshold,
                    actual: Some(actual),
                    status: if passed {
                        TargetStatus::Pass
                    } else {
                        TargetStatus::Fail
                    },
                }
            })
            .collect();
        Self::from_checks(checks, true)
    }

    /// Verdict for a run where no split produced returns: every configured
    /// target fails, and so does the run.
    pub fn unscored(targets: &TargetsDef) -> Self {
        let checks = configured_targets(targets)
            .into_iter()
            .map(|(metric, threshold)| TargetCheck {
                metric,
                threshold,
                actual: None,
                status: TargetStatus::Fail,
            })
            .collect();
        Self::from_checks(checks, false)
    }

    fn from_checks(checks: Vec<TargetCheck>, scored: bool) -> Self {
        let all_pass = checks.iter().all(|c| c.status == TargetStatus::Pass);
        Self {
            checks,
            overall: if scored && all_pass {
                TargetStatus::Pass
            } else {
                TargetStatus::Fail
            },
        }
    }

    pub fn passed(&self) -> bool {
        self.overall == TargetStatus::Pass
    }

    pub fn status_of(&self, metric: TargetMetric) -> Option<TargetStatus> {
        self.checks
            .iter()
            .find(|check| check.metric == metric)
            .map(|check| check.status)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TargetCheck> {
        self.checks
            .iter()
            .filter(|check| check.status == TargetStatus::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(sharpe: f64, maxdd: f64, avg_ic: f64) -> CoreMetrics {
        CoreMetrics {
            sharpe,
            maxdd,
            avg_ic,
            ..CoreMetrics::default()
        }
    }

    #[test]
    fn sharpe_below_target_fails_overall() {
        let verdict = Verdict::evaluate(&TargetsDef::default(), &core(1.5, -0.10, 0.06));

        assert_eq!(verdict.status_of(TargetMetric::Sharpe), Some(TargetStatus::Fail));
        assert_eq!(
            verdict.status_of(TargetMetric::MaxDrawdown),
            Some(TargetStatus::Pass)
        );
        assert_eq!(verdict.status_of(TargetMetric::AvgIc), Some(TargetStatus::Pass));
        assert_eq!(verdict.overall, TargetStatus::Fail);
        assert!(!verdict.passed());

        let sharpe = &verdict.checks[0];
        assert_eq!(sharpe.threshold, 1.8);
        assert_eq!(sharpe.actual, Some(1.5));
        assert_eq!(verdict.failures().count(), 1);
    }

    #[test]
    fn drawdown_compares_magnitude() {
        let verdict = Verdict::evaluate(&TargetsDef::default(), &core(2.0, -0.30, 0.06));
        assert_eq!(
            verdict.status_of(TargetMetric::MaxDrawdown),
            Some(TargetStatus::Fail)
        );
        assert_eq!(verdict.checks[1].actual, Some(0.30));
    }

    #[test]
    fn only_configured_targets_are_checked() {
        let targets = TargetsDef {
            min_sharpe: None,
            max_maxdd: None,
            min_avg_ic: None,
            min_ir: None,
            min_hit_rate: Some(0.5),
            max_turnover_monthly: Some(200.0),
        };
        let mut metrics = core(0.0, 0.0, 0.0);
        metrics.hit_rate = 0.55;
        metrics.turnover_monthly = 150.0;
        let verdict = Verdict::evaluate(&targets, &metrics);
        assert_eq!(verdict.checks.len(), 2);
        assert!(verdict.passed());
    }

    #[test]
    fn unscored_run_fails_every_target() {
        let verdict = Verdict::unscored(&TargetsDef::default());
        assert_eq!(verdict.checks.len(), 3);
        assert!(verdict.checks.iter().all(|c| c.actual.is_none()));
        assert_eq!(verdict.overall, TargetStatus::Fail);
    }

    #[test]
    fn statuses_serialize_lowercase() {
        let verdict = Verdict::evaluate(&TargetsDef::default(), &core(1.5, -0.10, 0.06));
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["overall"], "fail");
        assert_eq!(json["checks"][0]["metric"], "sharpe");
        assert_eq!(json["checks"][1]["metric"], "maxdd");
        assert_eq!(json["checks"][0]["status"], "fail");
    }
}
