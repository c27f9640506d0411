//! Look-ahead checks on factor signals.
//!
//! The static pass walks each expression tree and works out the smallest lag
//! at which it reads prices or returns; anything that resolves to lag 0 would
//! trade on data not yet known when positions are formed and is rejected.
//! The empirical pass looks at evaluated signals for suspicious correlation
//! with same-day returns and only warns.

use crate::config::{EngineConfig, IcMethod};
use crate::diagnostics::Diagnostic;
use crate::error::{EngineError, EngineResult};
use crate::evaluator::{CompiledSignal, SignalPanel};
use crate::expression::{Node, VOL_TARGET_RETURN_LAG};
use crate::metrics::information_coefficient;
use crate::models::Normalization;
use crate::panel::Panel;
use std::collections::HashMap;

/// Minimum data lag and history consumed by one expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LagProfile {
    /// `None` when the expression reads no market data at all.
    pub min_lag: Option<usize>,
    pub lookback: usize,
}

impl LagProfile {
    fn reads(lag: usize, lookback: usize) -> Self {
        Self {
            min_lag: Some(lag),
            lookback,
        }
    }

    fn combine(self, other: Self) -> Self {
        let min_lag = match (self.min_lag, other.min_lag) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            min_lag,
            lookback: self.lookback.max(other.lookback),
        }
    }

    fn delayed(self, periods: usize) -> Self {
        Self {
            min_lag: self.min_lag.map(|lag| lag.saturating_add(periods)),
            lookback: self.lookback.saturating_add(periods),
        }
    }

    fn widened(self, periods: usize) -> Self {
        Self {
            min_lag: self.min_lag,
            lookback: self.lookback.saturating_add(periods),
        }
    }
}

pub fn lag_profile(node: &Node, known: &HashMap<String, LagProfile>) -> LagProfile {
    match node {
        Node::Constant(_) => LagProfile::default(),
        Node::Signal(id) => known.get(id).copied().unwrap_or_default(),
        Node::LaggedReturn { lag, window } => {
            LagProfile::reads(*lag, lag.saturating_add(*window))
        }
        Node::DailyReturn { lag } => LagProfile::reads(*lag, lag.saturating_add(1)),
        Node::Price { lag } => LagProfile::reads(*lag, *lag),
        Node::Delay { input, periods } => lag_profile(input, known).delayed(*periods),
        Node::Delta { input, periods } => lag_profile(input, known).widened(*periods),
        Node::Rolling {
            stat,
            input,
            window,
        } => lag_profile(input, known).widened(stat.history(*window)),
        Node::Pairwise {
            left,
            right,
            window,
            ..
        }
        | Node::DecayedCorrelation {
            left,
            right,
            window,
            ..
        } => lag_profile(left, known)
            .combine(lag_profile(right, known))
            .widened(window.saturating_sub(1)),
        Node::VolatilityRegime {
            input,
            window,
            history,
            ..
        } => lag_profile(input, known)
            .widened(window.saturating_sub(1))
            .widened(history.saturating_sub(1)),
        Node::TrendRegime { input, long, .. } => {
            lag_profile(input, known).widened(long.saturating_sub(1))
        }
        Node::Negate(input)
        | Node::CrossSection { input, .. }
        | Node::Elementwise { input, .. }
        | Node::Power { input, .. } => lag_profile(input, known),
        Node::Binary { left, right, .. } | Node::Extremum { left, right, .. } => {
            lag_profile(left, known).combine(lag_profile(right, known))
        }
        Node::VolTarget {
            input,
            window,
            using,
            ..
        } => {
            let base = input
                .as_ref()
                .map(|input| lag_profile(input, known))
                .unwrap_or_default();
            let sigma = match using {
                Some(using) => lag_profile(using, known),
                None => LagProfile::reads(
                    VOL_TARGET_RETURN_LAG,
                    window.saturating_add(VOL_TARGET_RETURN_LAG),
                ),
            };
            base.combine(sigma)
        }
    }
}

/// Outcome of the static pass over all signals of a factor.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticAudit {
    pub profiles: Vec<(String, LagProfile)>,
    pub max_lookback: usize,
    pub complexity: f64,
}

/// Rejects any signal whose effective lag resolves to zero.
pub fn audit_signals(signals: &[CompiledSignal]) -> EngineResult<StaticAudit> {
    let mut known: HashMap<String, LagProfile> = HashMap::with_capacity(signals.len());
    let mut profiles = Vec::with_capacity(signals.len());
    for signal in signals {
        let mut profile = lag_profile(&signal.node, &known);
        if let Normalization::RollingZScore(window) = signal.normalization {
            profile = profile.widened(window.saturating_sub(1));
        }
        if profile.min_lag == Some(0) {
            return Err(EngineError::Leakage {
                signal_id: signal.id.clone(),
                reason: format!(
                    "{} reads same-day data (effective lag 0); every price or return input needs a lag of at least 1",
                    signal.expr
                ),
            });
        }
        known.insert(signal.id.clone(), profile);
        profiles.push((signal.id.clone(), profile));
    }

    let max_lookback = profiles
        .iter()
        .map(|(_, profile)| profile.lookback)
        .max()
        .unwrap_or(0);
    Ok(StaticAudit {
        profiles,
        max_lookback,
        complexity: complexity_score(signals),
    })
}

/// Bounded score in [0, 1] of how elaborate a factor's expressions are.
pub fn complexity_score(signals: &[CompiledSignal]) -> f64 {
    let calls: usize = signals.iter().map(|s| s.node.call_count()).sum();
    let depth = signals.iter().map(|s| s.node.depth()).max().unwrap_or(0);
    let raw = signals.len() as f64 * 0.3 + calls as f64 * 0.4 + depth as f64 * 0.3;
    (raw / 10.0).min(1.0)
}

/// Mean over dates of the cross-sectional correlation between the signal and
/// returns realized on the same date.
pub fn same_day_correlation(signal: &Panel, returns: &Panel, method: IcMethod) -> Option<f64> {
    let n_dates = signal.n_dates().min(returns.n_dates());
    let daily: Vec<f64> = (0..n_dates)
        .filter_map(|t| information_coefficient(signal.row(t), returns.row(t), method))
        .collect();
    if daily.is_empty() {
        None
    } else {
        Some(daily.iter().sum::<f64>() / daily.len() as f64)
    }
}

/// Same-day correlation of every evaluated signal, with a warning for each one
/// above the configured threshold.
pub fn empirical_check(
    signals: &[SignalPanel],
    returns: &Panel,
    config: &EngineConfig,
) -> (Vec<Option<f64>>, Vec<Diagnostic>) {
    let mut correlations = Vec::with_capacity(signals.len());
    let mut findings = Vec::new();
    for signal in signals {
        let correlation = same_day_correlation(&signal.panel, returns, config.ic_method);
        if let Some(value) = correlation {
            if value.abs() > config.leakage_correlation_threshold {
                let finding = Diagnostic::LeakageSuspected {
                    signal_id: signal.id.clone(),
                    correlation: value,
                    threshold: config.leakage_correlation_threshold,
                };
                finding.log();
                findings.push(finding);
            }
        }
        correlations.push(correlation);
    }
    (correlations, findings)
}
