use chrono::{Datelike, Duration, NaiveDate, Weekday};
use factor_engine::backtester::Backtester;
use factor_engine::config::EngineConfig;
use factor_engine::models::{FactorSpec, TargetsDef};
use factor_engine::panel::{MarketPanels, Panel};
use factor_engine::proposer::{create_proposer, ProposalContext, TEMPLATE_IDS};
use std::collections::HashMap;
use std::sync::Once;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn synthetic_panels(n_instruments: usize, n_dates: usize) -> MarketPanels {
    let mut dates = Vec::with_capacity(n_dates);
    let mut day = NaiveDate::from_ymd_opt(2015, 1, 2).unwrap();
    while dates.len() < n_dates {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            dates.push(day);
        }
        day += Duration::days(1);
    }

    let mut level: Vec<f64> = (0..n_instruments).map(|j| 50.0 + j as f64).collect();
    let mut rows = Vec::with_capacity(n_dates);
    for t in 0..n_dates {
        if t > 0 {
            for (j, price) in level.iter_mut().enumerate() {
                let amplitude = 0.004 + 0.001 * (j % 5) as f64;
                let wave = amplitude * ((t as f64) * (0.05 + 0.01 * j as f64) + j as f64).sin();
                let drift = 0.0001 * ((j % 7) as f64 - 3.0);
                *price *= 1.0 + drift + wave;
            }
        }
        rows.push(level.clone());
    }
    let instruments = (0..n_instruments).map(|j| format!("SYN{}", j)).collect();
    MarketPanels::new(Panel::from_rows(dates, instruments, rows).unwrap(), None).unwrap()
}

#[test]
fn every_template_is_leak_free_and_backtests() {
    ensure_test_env();
    let config = EngineConfig::default();
    let panels = synthetic_panels(20, 1300);

    for id in TEMPLATE_IDS {
        let spec = create_proposer(id)
            .unwrap()
            .propose(&ProposalContext::default())
            .unwrap();
        let audit = Backtester::new(&config).check_spec(&spec).unwrap();
        assert!(audit.max_lookback < spec.validation.min_history_days, "{}", id);
        assert!(audit.complexity > 0.0 && audit.complexity <= 1.0, "{}", id);

        let report = Backtester::new(&config).run(&spec, &panels).unwrap();
        assert_eq!(report.splits.len(), 5, "{}", id);
        assert_eq!(report.completed_splits(), 5, "{}", id);
        assert!(!report.returns.is_empty(), "{}", id);
        assert!(report.metrics.core.sharpe.is_finite(), "{}", id);
        assert_eq!(report.verdict.checks.len(), count_targets(&spec.targets), "{}", id);
    }
}

fn count_targets(targets: &TargetsDef) -> usize {
    [
        targets.min_sharpe,
        targets.max_maxdd,
        targets.min_avg_ic,
        targets.min_ir,
        targets.min_hit_rate,
        targets.max_turnover_monthly,
    ]
    .iter()
    .filter(|t| t.is_some())
    .count()
}

#[test]
fn tsmom_template_embargo_covers_its_lookback() {
    let config = EngineConfig::default();
    let spec = create_proposer("tsmom")
        .unwrap()
        .propose(&ProposalContext::default())
        .unwrap();
    let audit = Backtester::new(&config).check_spec(&spec).unwrap();
    // RET_LAG(1, 252) reads 253 periods, and zscore_252 adds 251
    assert_eq!(audit.max_lookback, 504);
    let ids: Vec<&str> = audit.profiles.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["mom_long", "vol", "risk_target"]);
}

#[test]
fn rendered_templates_survive_a_yaml_round_trip() {
    for id in TEMPLATE_IDS {
        let spec = create_proposer(id)
            .unwrap()
            .propose(&ProposalContext::default())
            .unwrap();
        let reparsed = FactorSpec::from_yaml(&spec.to_yaml().unwrap()).unwrap();
        assert_eq!(reparsed.name, spec.name);
        let exprs: Vec<&str> = reparsed.signals.iter().map(|s| s.expr.as_str()).collect();
        let original: Vec<&str> = spec.signals.iter().map(|s| s.expr.as_str()).collect();
        assert_eq!(exprs, original);
    }
}

#[test]
fn context_overrides_reach_the_spec() {
    let context = ProposalContext {
        universe: Some("sector_etfs".to_string()),
        targets: Some(TargetsDef {
            min_sharpe: Some(0.8),
            max_maxdd: None,
            min_avg_ic: None,
            ..TargetsDef::default()
        }),
        parameters: HashMap::from([("window".to_string(), 10.0)]),
        ..ProposalContext::default()
    };
    let spec = create_proposer("short_term_reversal")
        .unwrap()
        .propose(&context)
        .unwrap();
    assert_eq!(spec.universe, "sector_etfs");
    assert_eq!(spec.signals[0].expr, "-RET_LAG(1, 10)");
    assert_eq!(spec.targets.min_sharpe, Some(0.8));
    assert_eq!(spec.targets.max_maxdd, None);
}

#[test]
fn invalid_requests_are_errors() {
    let err = create_proposer("lightgbm").err().unwrap();
    assert!(err.to_string().contains("Unknown factor template: lightgbm"));

    let context = ProposalContext {
        parameters: HashMap::from([("lookback".to_string(), -5.0)]),
        ..ProposalContext::default()
    };
    assert!(create_proposer("tsmom").unwrap().propose(&context).is_err());
}
