use crate::config::EngineConfig;
use crate::diagnostics::{assess_metrics, Diagnostic};
use crate::error::{EngineError, EngineResult};
use crate::evaluator::{compile_signals, composite_signal, CompiledSignal, SignalEvaluator};
use crate::leakage::{self, StaticAudit};
use crate::metrics::{ic_series, MetricsCalculator, MetricsInputs};
use crate::models::{
    BacktestReport, FactorSpec, MetricsBundle, PortfolioReturns, SignalSummary, SplitOutcome,
    SplitReport,
};
use crate::panel::MarketPanels;
use crate::portfolio::{PortfolioConstructor, SplitBacktest};
use crate::splitter::{effective_embargo, PurgedWalkForward, Split, SplitSettings};
use crate::verdict::Verdict;
use log::{info, warn};
use rayon::prelude::*;
use std::time::Instant;

/// Walk-forward schedule for one factor over one panel.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPlan {
    pub splits: Vec<Split>,
    pub embargo_days: usize,
    pub diagnostics: Vec<Diagnostic>,
}

/// Runs factor specs end to end: parse, leakage gate, evaluate, split,
/// trade, score.
pub struct Backtester<'a> {
    config: &'a EngineConfig,
}

impl<'a> Backtester<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Parses every signal and runs the static lag check, without data.
    pub fn check_spec(&self, spec: &FactorSpec) -> EngineResult<StaticAudit> {
        self.prepare(spec).map(|(_, audit)| audit)
    }

    pub fn plan_splits(&self, spec: &FactorSpec, panels: &MarketPanels) -> EngineResult<SplitPlan> {
        let (_, audit) = self.prepare(spec)?;
        self.plan(spec, panels.n_dates(), audit.max_lookback)
    }

    pub fn run(&self, spec: &FactorSpec, panels: &MarketPanels) -> EngineResult<BacktestReport> {
        let started = Instant::now();
        let (compiled, audit) = self.prepare(spec)?;
        let plan = self.plan(spec, panels.n_dates(), audit.max_lookback)?;
        info!(
            "Backtesting factor {} on {} dates x {} instruments: {} splits, embargo {} days",
            spec.name,
            panels.n_dates(),
            panels.prices().n_instruments(),
            plan.splits.len(),
            plan.embargo_days
        );
        info!(
            "Portfolio {} rebalanced {}, scored by {}",
            spec.portfolio.scheme.as_str(),
            spec.portfolio.rebalance.as_str(),
            self.config.ic_method.label()
        );
        let mut diagnostics = plan.diagnostics.clone();
        for finding in &diagnostics {
            finding.log();
        }

        let periods_per_year = self
            .config
            .annualization(spec.frequency.periods_per_year());
        let evaluator =
            SignalEvaluator::new(panels, self.config.volatility_epsilon, periods_per_year);
        let evaluated = evaluator.evaluate_all(&compiled)?;
        let (correlations, suspected) =
            leakage::empirical_check(&evaluated, panels.returns(), self.config);
        diagnostics.extend(suspected);
        let signal = composite_signal(&evaluated, &spec.portfolio)?;

        let returns = panels.returns();
        let constructor = PortfolioConstructor::new(&spec.portfolio, self.config, periods_per_year);
        let prices = panels.prices();
        let run_split = |split: &Split| constructor.run_split(split, &signal, prices, returns);
        let outcomes: Vec<EngineResult<SplitBacktest>> = if self.config.parallel_splits {
            plan.splits.par_iter().map(run_split).collect()
        } else {
            plan.splits.iter().map(run_split).collect()
        };

        let mut split_reports = Vec::with_capacity(plan.splits.len());
        let mut records = Vec::new();
        let mut ic = Vec::new();
        let mut split_scores = Vec::new();
        for (split, outcome) in plan.splits.iter().zip(outcomes) {
            let window = split.window(panels.dates());
            let outcome = match outcome {
                Ok(result) => {
                    let net: Vec<f64> = result.returns.iter().map(|r| r.net).collect();
                    let split_ic =
                        ic_series(&signal, returns, split.test.clone(), self.config.ic_method);
                    let ic_values: Vec<f64> = split_ic.iter().map(|v| v.value).collect();
                    let sharpe = MetricsCalculator::sharpe_ratio(
                        &net,
                        periods_per_year,
                        self.config.risk_free_rate,
                    );
                    let (avg_ic, _, _, _) = MetricsCalculator::ic_summary(&ic_values);
                    info!(
                        "Split {} ({} to {}): {} days, Sharpe {:.2}, avg IC {:.3}",
                        split.index,
                        window.test_start,
                        window.test_end,
                        net.len(),
                        sharpe,
                        avg_ic
                    );
                    split_scores.push((sharpe, avg_ic));
                    let completed = SplitOutcome::Completed {
                        days: net.len(),
                        sharpe,
                        avg_ic,
                        rebalances: result.rebalances,
                        missing_return_days: result.missing_return_days,
                    };
                    records.extend(result.returns);
                    ic.extend(split_ic);
                    completed
                }
                Err(err) => {
                    let reason = match err {
                        EngineError::SplitComputation { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    let finding = Diagnostic::SplitFailed {
                        index: split.index,
                        reason: reason.clone(),
                    };
                    finding.log();
                    diagnostics.push(finding);
                    SplitOutcome::Failed { reason }
                }
            };
            split_reports.push(SplitReport { window, outcome });
        }

        let portfolio_returns = PortfolioReturns { records };
        let (metrics, verdict) = if portfolio_returns.is_empty() {
            warn!(
                "Every split of factor {} failed; nothing was scored",
                spec.name
            );
            (MetricsBundle::default(), Verdict::unscored(&spec.targets))
        } else {
            let metrics = MetricsCalculator::compute(&MetricsInputs {
                returns: &portfolio_returns,
                ic: &ic,
                market: returns,
                split_scores: &split_scores,
                periods_per_year,
                config: self.config,
            });
            let findings = assess_metrics(&metrics, self.config);
            for finding in &findings {
                finding.log();
            }
            diagnostics.extend(findings);
            let verdict = Verdict::evaluate(&spec.targets, &metrics.core);
            (metrics, verdict)
        };

        let signals = audit
            .profiles
            .iter()
            .zip(correlations)
            .map(|((id, profile), correlation)| SignalSummary {
                id: id.clone(),
                min_lag: profile.min_lag,
                lookback: profile.lookback,
                same_day_correlation: correlation,
            })
            .collect();

        info!(
            "Factor {} finished in {:.2}s: Sharpe {:.2}, avg IC {:.3}, maxdd {:.2}%, verdict {}",
            spec.name,
            started.elapsed().as_secs_f64(),
            metrics.core.sharpe,
            metrics.core.avg_ic,
            metrics.core.maxdd * 100.0,
            if verdict.passed() { "pass" } else { "fail" }
        );

        Ok(BacktestReport {
            factor_name: spec.name.clone(),
            universe: spec.universe.clone(),
            signals,
            complexity: audit.complexity,
            embargo_days: plan.embargo_days,
            splits: split_reports,
            returns: portfolio_returns,
            metrics,
            verdict,
            diagnostics,
        })
    }

    fn prepare(&self, spec: &FactorSpec) -> EngineResult<(Vec<CompiledSignal>, StaticAudit)> {
        spec.validate()?;
        let compiled = compile_signals(spec)?;
        let audit = leakage::audit_signals(&compiled)?;
        Ok((compiled, audit))
    }

    fn plan(&self, spec: &FactorSpec, n_dates: usize, max_lookback: usize) -> EngineResult<SplitPlan> {
        let validation = &spec.validation;
        let embargo_days = effective_embargo(
            validation.purge_gap_days,
            max_lookback,
            self.config.extend_embargo_to_lookback,
        );
        let mut diagnostics = Vec::new();
        if embargo_days > validation.purge_gap_days {
            diagnostics.push(Diagnostic::EmbargoExtended {
                purge_gap_days: validation.purge_gap_days,
                embargo_days,
            });
        }

        let walk = PurgedWalkForward::new(
            n_dates,
            SplitSettings {
                n_splits: validation
                    .n_splits
                    .unwrap_or(self.config.walk_forward_splits),
                min_history_days: validation.min_history_days,
                embargo_days,
                min_test_days: self.config.min_test_days,
            },
        )?;
        diagnostics.extend(walk.reduction());
        Ok(SplitPlan {
            splits: walk.collect(),
            embargo_days,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalDef;
    use crate::panel::Panel;
    use chrono::NaiveDate;

    fn spec(expr: &str, min_history_days: usize) -> FactorSpec {
        let mut spec = FactorSpec::from_yaml(&format!(
            "name: unit\nsignals:\n  - id: s\n    expr: \"{}\"\n",
            expr
        ))
        .unwrap();
        spec.validation.min_history_days = min_history_days;
        spec.validation.purge_gap_days = 5;
        spec
    }

    fn panels(n_dates: usize) -> MarketPanels {
        let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
        let dates = (0..n_dates)
            .map(|i| start + chrono::Duration::days(i as i64))
            .collect();
        let rows = (0..n_dates)
            .map(|t| {
                let t = t as f64;
                vec![100.0 + t, 100.0 + 0.5 * t, 100.0 - 0.1 * t]
            })
            .collect();
        let prices = Panel::from_rows(dates, vec!["A".into(), "B".into(), "C".into()], rows).unwrap();
        MarketPanels::new(prices, None).unwrap()
    }

    #[test]
    fn check_spec_reports_lookback() {
        let config = EngineConfig::default();
        let audit = Backtester::new(&config)
            .check_spec(&spec("RET_LAG(1, 20)", 100))
            .unwrap();
        assert_eq!(audit.max_lookback, 21);
    }

    #[test]
    fn plan_extends_embargo_and_reduces_splits() {
        let config = EngineConfig::default();
        let plan = Backtester::new(&config)
            .plan_splits(&spec("RET_LAG(1, 20)", 100), &panels(200))
            .unwrap();
        assert_eq!(plan.embargo_days, 21);
        assert_eq!(plan.splits.len(), 1);
        assert!(plan.diagnostics.contains(&Diagnostic::EmbargoExtended {
            purge_gap_days: 5,
            embargo_days: 21,
        }));
        assert!(plan
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::ReducedSplits { built: 1, .. })));
    }

    #[test]
    fn parallel_and_sequential_runs_agree() {
        let spec = spec("RET_LAG(1, 10)", 60);
        let panels = panels(200);
        let parallel = EngineConfig {
            min_test_days: 20,
            ..EngineConfig::default()
        };
        let sequential = EngineConfig {
            parallel_splits: false,
            ..parallel.clone()
        };
        let a = Backtester::new(&parallel).run(&spec, &panels).unwrap();
        let b = Backtester::new(&sequential).run(&spec, &panels).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.splits.len(), 5);
        assert_eq!(a.completed_splits(), 5);
    }

    #[test]
    fn leakage_gate_runs_before_data_checks() {
        let config = EngineConfig::default();
        let spec = FactorSpec {
            signals: vec![SignalDef {
                id: "peek".to_string(),
                expr: "RET_D".to_string(),
                normalize: None,
            }],
            ..spec("RET_LAG(1, 5)", 5000)
        };
        let err = Backtester::new(&config).run(&spec, &panels(50)).unwrap_err();
        assert!(matches!(err, EngineError::Leakage { .. }));
    }

    #[test]
    fn huge_windows_are_configuration_errors() {
        let config = EngineConfig::default();
        let backtester = Backtester::new(&config);

        let err = backtester
            .check_spec(&spec("ROLL_MEAN(RET_LAG(1, 5), 1e20)", 100))
            .unwrap_err();
        assert!(matches!(err, EngineError::SignalConfiguration { .. }));

        let widest = spec(
            "DELAY(ROLL_MEAN(RET_LAG(1, 4294967295), 4294967295), 4294967295)",
            100,
        );
        let audit = backtester.check_spec(&widest).unwrap();
        assert!(audit.max_lookback > 3 * 4_294_967_294);
        let err = backtester.run(&widest, &panels(200)).unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[test]
    fn deeply_nested_expression_is_a_signal_error() {
        let config = EngineConfig::default();
        let expr = format!("{}RET_LAG(1, 5){}", "(".repeat(10_000), ")".repeat(10_000));
        let err = Backtester::new(&config)
            .check_spec(&spec(&expr, 100))
            .unwrap_err();
        match err {
            EngineError::SignalConfiguration { reason, .. } => {
                assert!(reason.contains("nests deeper"), "{}", reason)
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
