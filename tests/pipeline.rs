use chrono::{Datelike, Duration, NaiveDate, Weekday};
use factor_engine::backtester::Backtester;
use factor_engine::config::{EngineConfig, IcMethod};
use factor_engine::error::EngineError;
use factor_engine::evaluator::{compile_signals, composite_signal, SignalEvaluator};
use factor_engine::metrics::ic_series;
use factor_engine::diagnostics::Diagnostic;
use factor_engine::models::{
    CoreMetrics, FactorSpec, Frequency, MetricsBundle, SplitOutcome, TargetsDef,
};
use factor_engine::panel::{MarketPanels, Panel};
use factor_engine::verdict::{TargetMetric, TargetStatus, Verdict};
use std::sync::Once;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn business_days(count: usize) -> Vec<NaiveDate> {
    let mut dates = Vec::with_capacity(count);
    let mut day = NaiveDate::from_ymd_opt(2019, 1, 2).unwrap();
    while dates.len() < count {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            dates.push(day);
        }
        day += Duration::days(1);
    }
    dates
}

fn tickers(count: usize) -> Vec<String> {
    (0..count).map(|j| format!("T{:02}", j)).collect()
}

/// Prices compounding a fixed daily return per instrument.
fn drifting_prices(daily_returns: &[f64], n_dates: usize) -> Panel {
    let rows = (0..n_dates)
        .map(|t| {
            daily_returns
                .iter()
                .map(|r| 100.0 * (1.0 + r).powi(t as i32))
                .collect()
        })
        .collect();
    Panel::from_rows(business_days(n_dates), tickers(daily_returns.len()), rows).unwrap()
}

/// Deterministic wavy prices with a distinct drift per instrument.
fn wavy_prices(n_instruments: usize, n_dates: usize) -> Panel {
    let mut level = vec![100.0; n_instruments];
    let mut rows = Vec::with_capacity(n_dates);
    for t in 0..n_dates {
        if t > 0 {
            for (j, price) in level.iter_mut().enumerate() {
                let drift = 0.0002 * (j as f64 - n_instruments as f64 / 2.0);
                let wave = 0.012 * ((t as f64) * 0.21 + j as f64 * 1.7).sin();
                *price *= 1.0 + drift + wave;
            }
        }
        rows.push(level.clone());
    }
    Panel::from_rows(business_days(n_dates), tickers(n_instruments), rows).unwrap()
}

/// Drifting prices with every instrument in `columns` unpriced over `dates`.
fn with_gap(
    daily_returns: &[f64],
    n_dates: usize,
    dates: std::ops::Range<usize>,
    columns: &[usize],
) -> Panel {
    let rows = (0..n_dates)
        .map(|t| {
            daily_returns
                .iter()
                .enumerate()
                .map(|(j, r)| {
                    if dates.contains(&t) && columns.contains(&j) {
                        f64::NAN
                    } else {
                        100.0 * (1.0 + r).powi(t as i32)
                    }
                })
                .collect()
        })
        .collect();
    Panel::from_rows(business_days(n_dates), tickers(daily_returns.len()), rows).unwrap()
}

fn spec_yaml(expr: &str, min_history_days: usize, purge_gap_days: usize) -> FactorSpec {
    FactorSpec::from_yaml(&format!(
        r#"
name: pipeline
signals:
  - id: alpha
    expr: "{}"
portfolio:
  scheme: long_short_deciles
  rebalance: M
validation:
  min_history_days: {}
  purge_gap_days: {}
"#,
        expr, min_history_days, purge_gap_days
    ))
    .unwrap()
}

#[test]
fn same_day_signal_is_rejected_before_backtesting() {
    ensure_test_env();
    let config = EngineConfig::default();
    let panels = MarketPanels::new(wavy_prices(10, 400), None).unwrap();

    for expr in ["RET_LAG(0, 20)", "RET_D", "ROLL_MEAN(PRICE, 5)"] {
        let spec = spec_yaml(expr, 100, 10);
        let err = Backtester::new(&config).run(&spec, &panels).unwrap_err();
        match err {
            EngineError::Leakage { signal_id, .. } => assert_eq!(signal_id, "alpha"),
            other => panic!("expected leakage error for {}, got {}", expr, other),
        }
    }
}

#[test]
fn splits_keep_the_purge_gap_and_never_overlap() {
    ensure_test_env();
    let config = EngineConfig {
        min_test_days: 40,
        ..EngineConfig::default()
    };
    let panels = MarketPanels::new(wavy_prices(6, 700), None).unwrap();
    let spec = spec_yaml("RET_LAG(1, 5)", 300, 15);

    let plan = Backtester::new(&config).plan_splits(&spec, &panels).unwrap();
    assert_eq!(plan.splits.len(), 5);
    assert_eq!(plan.embargo_days, 15);
    for split in &plan.splits {
        assert!(split.train.end <= split.test.start);
        assert!(split.test.start - split.train.end >= 15);
        assert_eq!(split.train.start, 0);
    }
    for pair in plan.splits.windows(2) {
        assert!(pair[0].test.end <= pair[1].test.start);
    }
    assert_eq!(plan.splits[0].test.start, 300);
    assert_eq!(plan.splits[4].test.end, 700);
}

#[test]
fn repeated_runs_produce_identical_reports() {
    ensure_test_env();
    let config = EngineConfig {
        min_test_days: 40,
        ..EngineConfig::default()
    };
    let panels = MarketPanels::new(wavy_prices(20, 600), None).unwrap();
    let spec = spec_yaml("-RET_LAG(1, 10)", 200, 21);

    let first = Backtester::new(&config).run(&spec, &panels).unwrap();
    let second = Backtester::new(&config).run(&spec, &panels).unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(first.completed_splits(), 5);
}

#[test]
fn short_history_is_a_configuration_error() {
    ensure_test_env();
    let config = EngineConfig::default();
    let panels = MarketPanels::new(wavy_prices(10, 500), None).unwrap();
    let spec = spec_yaml("RET_LAG(1, 20)", 800, 21);

    let err = Backtester::new(&config).run(&spec, &panels).unwrap_err();
    assert!(matches!(err, EngineError::Configuration { .. }));
    assert!(err.to_string().contains("min_history_days"));
}

#[test]
fn constant_prices_give_zero_sharpe_and_no_costs() {
    ensure_test_env();
    let config = EngineConfig::default();
    let panels = MarketPanels::new(drifting_prices(&[0.0; 8], 1000), None).unwrap();
    let spec = spec_yaml("RET_LAG(1, 252) - RET_LAG(1, 21)", 300, 21);

    let report = Backtester::new(&config).run(&spec, &panels).unwrap();
    assert_eq!(report.embargo_days, 253);
    assert_eq!(report.completed_splits(), report.splits.len());
    assert!(!report.returns.is_empty());
    assert_eq!(report.metrics.core.sharpe, 0.0);
    assert_eq!(report.returns.total_cost(), 0.0);
    assert!(report.returns.records.iter().all(|r| r.net == 0.0));
    assert_eq!(
        report.verdict.status_of(TargetMetric::Sharpe),
        Some(TargetStatus::Fail)
    );
}

#[test]
fn persistent_outperformer_earns_every_day_with_perfect_ic() {
    ensure_test_env();
    let config = EngineConfig {
        min_test_days: 20,
        ..EngineConfig::default()
    };
    let panels = MarketPanels::new(drifting_prices(&[0.003, -0.001], 400), None).unwrap();
    let spec = spec_yaml("RET_LAG(1, 5)", 100, 10);

    let report = Backtester::new(&config).run(&spec, &panels).unwrap();
    assert_eq!(report.completed_splits(), 5);
    assert!(report.returns.records.iter().all(|r| r.net > 0.0));
    assert!(report.returns.records.iter().all(|r| (r.gross - 0.002).abs() < 1e-9));
    for split in &report.splits {
        if let SplitOutcome::Completed { sharpe, avg_ic, .. } = split.outcome {
            assert!(sharpe > 0.0);
            assert!((avg_ic - 1.0).abs() < 1e-12);
        }
    }
    assert!((report.metrics.core.avg_ic - 1.0).abs() < 1e-12);
    assert!((report.metrics.core.hit_rate - 1.0).abs() < 1e-12);

    let compiled = compile_signals(&spec).unwrap();
    let evaluated = SignalEvaluator::new(&panels, config.volatility_epsilon, 252.0)
        .evaluate_all(&compiled)
        .unwrap();
    let signal = composite_signal(&evaluated, &spec.portfolio).unwrap();
    let ic = ic_series(&signal, panels.returns(), 100..400, IcMethod::Spearman);
    assert_eq!(ic.len(), 299);
    assert!(ic.iter().all(|v| (v.value - 1.0).abs() < 1e-12));
}

#[test]
fn sharpe_short_of_target_fails_only_that_check() {
    let targets = TargetsDef {
        min_sharpe: Some(1.8),
        max_maxdd: Some(0.25),
        min_avg_ic: Some(0.05),
        ..TargetsDef::default()
    };
    let core = CoreMetrics {
        sharpe: 1.5,
        maxdd: -0.12,
        avg_ic: 0.07,
        ..CoreMetrics::default()
    };

    let verdict = Verdict::evaluate(&targets, &core);
    assert_eq!(verdict.status_of(TargetMetric::Sharpe), Some(TargetStatus::Fail));
    assert_eq!(
        verdict.status_of(TargetMetric::MaxDrawdown),
        Some(TargetStatus::Pass)
    );
    assert_eq!(verdict.status_of(TargetMetric::AvgIc), Some(TargetStatus::Pass));
    assert_eq!(verdict.overall, TargetStatus::Fail);
    assert!(!verdict.passed());

    let json = serde_json::to_value(&verdict).unwrap();
    assert_eq!(json["overall"], "fail");
    assert_eq!(json["checks"][0]["metric"], "sharpe");
}

#[test]
fn delisted_instrument_is_not_held_past_its_last_price() {
    ensure_test_env();
    let config = EngineConfig {
        min_test_days: 20,
        ..EngineConfig::default()
    };
    // the third instrument stops trading at date 150
    let prices = with_gap(&[0.003, -0.001, 0.01], 300, 150..300, &[2]);
    let panels = MarketPanels::new(prices, None).unwrap();
    let mut spec = spec_yaml("RET_LAG(1, 5)", 100, 10);
    spec.portfolio.rebalance = Frequency::Daily;

    let report = Backtester::new(&config).run(&spec, &panels).unwrap();
    assert_eq!(report.completed_splits(), 5);
    let missing: Vec<usize> = report
        .splits
        .iter()
        .map(|split| match split.outcome {
            SplitOutcome::Completed {
                missing_return_days,
                ..
            } => missing_return_days,
            SplitOutcome::Failed { .. } => panic!("split failed: {:?}", split),
        })
        .collect();
    // only the return of the last day it was held while still listed
    assert_eq!(missing, vec![0, 1, 0, 0, 0]);

    let dates = business_days(300);
    for record in &report.returns.records {
        if record.date < dates[150] {
            assert!((record.gross - 0.0055).abs() < 1e-9, "{:?}", record);
        } else if record.date > dates[150] {
            assert!((record.gross - 0.002).abs() < 1e-9, "{:?}", record);
        }
    }
}

#[test]
fn one_failed_split_leaves_the_others_scored() {
    ensure_test_env();
    let config = EngineConfig {
        min_test_days: 20,
        ..EngineConfig::default()
    };
    // the whole market is dark through the second test window
    let prices = with_gap(&[0.003, -0.001, 0.001], 300, 140..180, &[0, 1, 2]);
    let panels = MarketPanels::new(prices, None).unwrap();
    let mut spec = spec_yaml("RET_LAG(1, 5)", 100, 10);
    spec.targets.min_sharpe = Some(0.5);

    let report = Backtester::new(&config).run(&spec, &panels).unwrap();
    assert_eq!(report.splits.len(), 5);
    assert_eq!(report.completed_splits(), 4);
    assert!(matches!(report.splits[1].outcome, SplitOutcome::Failed { .. }));
    assert!(report
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::SplitFailed { index: 1, .. })));

    let window = &report.splits[1].window;
    assert!(report
        .returns
        .records
        .iter()
        .all(|r| r.date <= window.test_start || r.date > window.test_end));
    assert!(!report.returns.is_empty());
    assert!(report.verdict.checks.iter().all(|c| c.actual.is_some()));
}

#[test]
fn run_with_no_scorable_split_is_unscored() {
    ensure_test_env();
    let config = EngineConfig {
        min_test_days: 20,
        ..EngineConfig::default()
    };
    // a single instrument can never form a long/short book
    let panels = MarketPanels::new(drifting_prices(&[0.001], 300), None).unwrap();
    let mut spec = spec_yaml("RET_LAG(1, 5)", 100, 10);
    spec.targets = TargetsDef {
        min_sharpe: Some(1.0),
        min_avg_ic: Some(0.02),
        ..TargetsDef::default()
    };

    let report = Backtester::new(&config).run(&spec, &panels).unwrap();
    assert_eq!(report.completed_splits(), 0);
    assert!(report.returns.is_empty());
    assert_eq!(report.metrics, MetricsBundle::default());
    assert_eq!(report.verdict, Verdict::unscored(&spec.targets));
    assert_eq!(report.verdict.checks.len(), 2);
    assert!(report.verdict.checks.iter().all(|c| c.actual.is_none()));
    assert_eq!(report.verdict.overall, TargetStatus::Fail);
    let failed = report
        .diagnostics
        .iter()
        .filter(|d| matches!(d, Diagnostic::SplitFailed { .. }))
        .count();
    assert_eq!(failed, 5);
}

#[test]
fn signal_tracking_same_day_returns_is_flagged() {
    ensure_test_env();
    let config = EngineConfig {
        min_test_days: 20,
        ..EngineConfig::default()
    };
    // constant returns make yesterday's cross-section identical to today's
    let prices = drifting_prices(&[0.003, -0.001, 0.001, 0.002], 300);
    let panels = MarketPanels::new(prices, None).unwrap();
    let spec = spec_yaml("RET_LAG(1, 1)", 100, 10);

    let report = Backtester::new(&config).run(&spec, &panels).unwrap();
    let flagged: Vec<f64> = report
        .diagnostics
        .iter()
        .filter_map(|d| match d {
            Diagnostic::LeakageSuspected {
                signal_id,
                correlation,
                ..
            } if signal_id == "alpha" => Some(*correlation),
            _ => None,
        })
        .collect();
    assert_eq!(flagged.len(), 1);
    assert!((flagged[0] - 1.0).abs() < 1e-9);
    assert_eq!(report.signals[0].same_day_correlation, Some(flagged[0]));
    assert_eq!(report.completed_splits(), 5);
}
