use crate::error::{EngineError, EngineResult};
use crate::expression::{
    parse_expression, CrossSectionOp, ElementwiseOp, ExtremumOp, Node, PairStat, RollingStat,
    SignalScope, VOL_TARGET_RETURN_LAG,
};
use crate::models::{FactorSpec, Normalization, PortfolioDef, SignalCombine};
use crate::panel::{MarketPanels, Panel};
use crate::primitives;
use log::debug;
use std::collections::HashMap;

/// A declared signal after parsing and binding.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSignal {
    pub id: String,
    pub expr: String,
    pub node: Node,
    pub normalization: Normalization,
}

/// Evaluated (and normalized) values of one signal.
#[derive(Debug, Clone)]
pub struct SignalPanel {
    pub id: String,
    pub panel: Panel,
}

/// Parses every signal of the factor in declaration order. Each expression
/// may only refer to signals declared before it.
pub fn compile_signals(spec: &FactorSpec) -> EngineResult<Vec<CompiledSignal>> {
    let declared: Vec<String> = spec.signals.iter().map(|s| s.id.clone()).collect();
    spec.signals
        .iter()
        .enumerate()
        .map(|(index, signal)| {
            let configuration_error = |reason: String| EngineError::SignalConfiguration {
                signal_id: signal.id.clone(),
                expr: signal.expr.clone(),
                reason,
            };
            let scope = SignalScope {
                declared: &declared,
                current: index,
            };
            let node = parse_expression(&signal.expr, scope)
                .map_err(|err| configuration_error(err.to_string()))?;
            let normalization = Normalization::parse(signal.normalize.as_deref())
                .map_err(|err| configuration_error(err.to_string()))?;
            Ok(CompiledSignal {
                id: signal.id.clone(),
                expr: signal.expr.clone(),
                node,
                normalization,
            })
        })
        .collect()
}

/// Evaluates expression trees against the market panels.
pub struct SignalEvaluator<'a> {
    panels: &'a MarketPanels,
    epsilon: f64,
    periods_per_year: f64,
}

impl<'a> SignalEvaluator<'a> {
    pub fn new(panels: &'a MarketPanels, epsilon: f64, periods_per_year: f64) -> Self {
        Self {
            panels,
            epsilon,
            periods_per_year,
        }
    }

    /// Evaluates the signals in order; later signals see the normalized
    /// values of earlier ones.
    pub fn evaluate_all(&self, signals: &[CompiledSignal]) -> EngineResult<Vec<SignalPanel>> {
        let mut computed: HashMap<String, Panel> = HashMap::with_capacity(signals.len());
        let mut evaluated = Vec::with_capacity(signals.len());
        for signal in signals {
            let raw = self
                .evaluate(&signal.node, &computed)
                .map_err(|err| attribute(err, signal))?;
            let panel = self.normalize(&raw, signal.normalization);
            debug!(
                "Evaluated signal {} ({} present values)",
                signal.id,
                panel.present_count()
            );
            computed.insert(signal.id.clone(), panel.clone());
            evaluated.push(SignalPanel {
                id: signal.id.clone(),
                panel,
            });
        }
        Ok(evaluated)
    }

    pub fn evaluate(&self, node: &Node, computed: &HashMap<String, Panel>) -> EngineResult<Panel> {
        let prices = self.panels.prices();
        let returns = self.panels.returns();
        let panel = match node {
            Node::Constant(value) => prices.filled_like(*value),
            Node::Signal(id) => computed.get(id).cloned().ok_or_else(|| {
                EngineError::configuration(format!("signal {} has not been evaluated", id))
            })?,
            Node::Negate(input) => self.evaluate(input, computed)?.map(|v| -v),
            Node::Binary { op, left, right } => {
                let left = self.evaluate(left, computed)?;
                let right = self.evaluate(right, computed)?;
                left.zip_with(&right, |a, b| op.apply(a, b))?
            }
            Node::LaggedReturn { lag, window } => {
                prices.try_map_columns(|column| primitives::lagged_return(column, *lag, *window))?
            }
            Node::DailyReturn { lag } => {
                returns.map_columns(|column| primitives::shift(column, *lag))
            }
            Node::Price { lag } => prices.map_columns(|column| primitives::shift(column, *lag)),
            Node::Delay { input, periods } => self
                .evaluate(input, computed)?
                .map_columns(|column| primitives::shift(column, *periods)),
            Node::Delta { input, periods } => self
                .evaluate(input, computed)?
                .map_columns(|column| primitives::delta(column, *periods)),
            Node::Rolling {
                stat,
                input,
                window,
            } => {
                let input = self.evaluate(input, computed)?;
                let window = *window;
                let epsilon = self.epsilon;
                input.map_columns(|column| match stat {
                    RollingStat::Mean => primitives::rolling_mean(column, window),
                    RollingStat::Std => primitives::rolling_std(column, window),
                    RollingStat::Sum => primitives::rolling_sum(column, window),
                    RollingStat::Max => primitives::rolling_max(column, window),
                    RollingStat::Min => primitives::rolling_min(column, window),
                    RollingStat::Rank => primitives::ts_rank(column, window),
                    RollingStat::ZScore => primitives::ts_zscore(column, window, epsilon),
                    RollingStat::DecayLinear => primitives::decay_linear(column, window),
                    RollingStat::Product => primitives::rolling_product(column, window),
                    RollingStat::Skew => primitives::rolling_skew(column, window),
                    RollingStat::Kurtosis => primitives::rolling_kurtosis(column, window),
                    RollingStat::ArgMax => primitives::ts_argmax(column, window),
                    RollingStat::ArgMin => primitives::ts_argmin(column, window),
                    RollingStat::DrawdownRecovery => {
                        primitives::drawdown_recovery(column, window)
                    }
                })
            }
            Node::Pairwise {
                stat,
                left,
                right,
                window,
            } => {
                let left = self.evaluate(left, computed)?;
                let right = self.evaluate(right, computed)?;
                left.zip_columns(&right, |a, b| match stat {
                    PairStat::Correlation => primitives::rolling_correlation(a, b, *window),
                    PairStat::Covariance => primitives::rolling_covariance(a, b, *window),
                })?
            }
            Node::DecayedCorrelation {
                left,
                right,
                window,
                decay,
            } => {
                let left = self.evaluate(left, computed)?;
                let right = self.evaluate(right, computed)?;
                left.zip_columns(&right, |a, b| {
                    primitives::decayed_correlation(a, b, *window, *decay)
                })?
            }
            Node::VolatilityRegime {
                input,
                window,
                threshold,
                history,
            } => self.evaluate(input, computed)?.map_columns(|column| {
                primitives::volatility_regime(column, *window, *threshold, *history)
            }),
            Node::TrendRegime { input, short, long } => self
                .evaluate(input, computed)?
                .map_columns(|column| primitives::trend_regime(column, *short, *long)),
            Node::CrossSection { op, input } => {
                let input = self.evaluate(input, computed)?;
                let epsilon = self.epsilon;
                input.map_rows(|row| match op {
                    CrossSectionOp::ZScore => primitives::cs_zscore(row, epsilon),
                    CrossSectionOp::Rank => primitives::cs_rank(row),
                    CrossSectionOp::Demean => primitives::cs_demean(row),
                    CrossSectionOp::Scale => primitives::cs_scale(row),
                })
            }
            Node::VolTarget {
                input,
                ann_vol,
                window,
                using,
            } => {
                let base = match input {
                    Some(input) => self.evaluate(input, computed)?,
                    None => prices.filled_like(1.0),
                };
                let sigma = match using {
                    Some(using) => {
                        let scale = self.periods_per_year.sqrt();
                        self.evaluate(using, computed)?.map(|v| v * scale)
                    }
                    None => returns.map_columns(|column| {
                        primitives::trailing_volatility(
                            column,
                            *window,
                            VOL_TARGET_RETURN_LAG,
                            self.periods_per_year,
                        )
                    }),
                };
                let epsilon = self.epsilon;
                base.zip_with(&sigma, |x, s| x * ann_vol / (s + epsilon))?
            }
            Node::Elementwise { op, input } => {
                let input = self.evaluate(input, computed)?;
                match op {
                    ElementwiseOp::Abs => input.map(f64::abs),
                    ElementwiseOp::Sign => input.map(sign),
                    ElementwiseOp::Log => input.map(primitives::clipped_log),
                }
            }
            Node::Power { input, exponent } => self
                .evaluate(input, computed)?
                .map(|v| primitives::signed_power(v, *exponent)),
            Node::Extremum { op, left, right } => {
                let left = self.evaluate(left, computed)?;
                let right = self.evaluate(right, computed)?;
                left.zip_with(&right, |a, b| {
                    if a.is_nan() || b.is_nan() {
                        f64::NAN
                    } else {
                        match op {
                            ExtremumOp::Max => a.max(b),
                            ExtremumOp::Min => a.min(b),
                        }
                    }
                })?
            }
        };
        Ok(panel)
    }

    pub fn normalize(&self, panel: &Panel, normalization: Normalization) -> Panel {
        let epsilon = self.epsilon;
        match normalization {
            Normalization::None => panel.clone(),
            Normalization::ZScore => panel.map_rows(|row| primitives::cs_zscore(row, epsilon)),
            Normalization::Rank => panel.map_rows(primitives::cs_rank),
            Normalization::Demean => panel.map_rows(primitives::cs_demean),
            Normalization::RollingZScore(window) => {
                panel.map_columns(|column| primitives::ts_zscore(column, window, epsilon))
            }
        }
    }
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        // keeps NaN missing and zero flat
        value
    }
}

fn attribute(err: EngineError, signal: &CompiledSignal) -> EngineError {
    match err {
        EngineError::Configuration { message } => EngineError::SignalConfiguration {
            signal_id: signal.id.clone(),
            expr: signal.expr.clone(),
            reason: message,
        },
        other => other,
    }
}

/// The signal the portfolio trades: the named one, the mean of all of them,
/// or the last declared.
pub fn composite_signal(
    signals: &[SignalPanel],
    portfolio: &PortfolioDef,
) -> EngineResult<Panel> {
    if let Some(traded) = &portfolio.signal {
        return signals
            .iter()
            .find(|signal| &signal.id == traded)
            .map(|signal| signal.panel.clone())
            .ok_or_else(|| {
                EngineError::configuration(format!(
                    "portfolio.signal {} does not name a declared signal",
                    traded
                ))
            });
    }

    let Some(last) = signals.last() else {
        return Err(EngineError::configuration("no signals were evaluated"));
    };
    match portfolio.combine {
        SignalCombine::Last => Ok(last.panel.clone()),
        SignalCombine::Mean => {
            let count = signals.len() as f64;
            let mut total = signals[0].panel.clone();
            for signal in &signals[1..] {
                total = total.zip_with(&signal.panel, |a, b| a + b)?;
            }
            Ok(total.map(|v| v / count))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalDef;
    use chrono::NaiveDate;

    fn market(rows: Vec<Vec<f64>>) -> MarketPanels {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let dates = (0..rows.len())
            .map(|i| start + chrono::Duration::days(i as i64))
            .collect();
        let instruments = (0..rows[0].len()).map(|j| format!("I{}", j)).collect();
        let prices = Panel::from_rows(dates, instruments, rows).unwrap();
        MarketPanels::new(prices, None).unwrap()
    }

    fn trending_market() -> MarketPanels {
        let rows = (0..30)
            .map(|t| {
                let t = t as f64;
                vec![100.0 * 1.01f64.powf(t), 100.0, 100.0 * 0.99f64.powf(t)]
            })
            .collect();
        market(rows)
    }

    fn spec(signals: &[(&str, &str, Option<&str>)]) -> FactorSpec {
        FactorSpec {
            name: "test".to_string(),
            universe: "default".to_string(),
            frequency: Default::default(),
            description: None,
            signals: signals
                .iter()
                .map(|(id, expr, normalize)| SignalDef {
                    id: id.to_string(),
                    expr: expr.to_string(),
                    normalize: normalize.map(str::to_string),
                })
                .collect(),
            portfolio: Default::default(),
            validation: Default::default(),
            targets: Default::default(),
        }
    }

    fn evaluate_spec(spec: &FactorSpec, panels: &MarketPanels) -> Vec<SignalPanel> {
        let compiled = compile_signals(spec).unwrap();
        SignalEvaluator::new(panels, 0.001, 252.0)
            .evaluate_all(&compiled)
            .unwrap()
    }

    #[test]
    fn lagged_return_spread_matches_prices() {
        let panels = trending_market();
        let spec = spec(&[("mom", "RET_LAG(1, 5) - RET_LAG(1, 2)", None)]);
        let signals = evaluate_spec(&spec, &panels);
        let panel = &signals[0].panel;

        let expected = 1.01f64.powi(5) - 1.0 - (1.01f64.powi(2) - 1.0);
        assert!((panel.value(10, 0) - expected).abs() < 1e-9);
        assert!(panel.value(10, 1).abs() < 1e-12);
        assert!(panel.value(5, 0).is_nan());
        assert!(panel.value(6, 0).is_finite());
    }

    #[test]
    fn zscore_normalization_is_idempotent() {
        let panels = trending_market();
        let spec = spec(&[
            ("mom", "RET_LAG(1, 5)", Some("zscore")),
            ("again", "ZSCORE(mom)", None),
        ]);
        let signals = evaluate_spec(&spec, &panels);
        let once = &signals[0].panel;
        let twice = &signals[1].panel;
        for t in 0..once.n_dates() {
            for j in 0..once.n_instruments() {
                let (a, b) = (once.value(t, j), twice.value(t, j));
                assert!(a.is_nan() == b.is_nan());
                if a.is_finite() {
                    assert!((a - b).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn signal_references_see_normalized_values() {
        let panels = trending_market();
        let spec = spec(&[
            ("ranked", "RET_LAG(1, 3)", Some("rank")),
            ("doubled", "ranked * 2", None),
        ]);
        let signals = evaluate_spec(&spec, &panels);
        assert!((signals[1].panel.value(12, 0) - 2.0).abs() < 1e-12);
        assert!((signals[1].panel.value(12, 2) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn vol_target_scales_by_trailing_volatility() {
        let rows = (0..40)
            .map(|t| {
                let wiggle = if t % 2 == 0 { 1.0 } else { 1.02 };
                vec![100.0 * wiggle, 50.0]
            })
            .collect();
        let panels = market(rows);
        let spec = spec(&[("risk", "VOL_TARGET(ann_vol=0.15, window=5)", None)]);
        let signals = evaluate_spec(&spec, &panels);
        let panel = &signals[0].panel;

        let column = panels.returns().column(0);
        let sigma = primitives::trailing_volatility(&column, 5, 1, 252.0);
        let expected = 0.15 / (sigma[20] + 0.001);
        assert!((panel.value(20, 0) - expected).abs() < 1e-9);
        // flat instrument has zero volatility, so only epsilon bounds the scale
        assert!((panel.value(20, 1) - 0.15 / 0.001).abs() < 1e-6);
    }

    #[test]
    fn division_by_zero_is_missing() {
        let panels = trending_market();
        let spec = spec(&[("ratio", "1 / RET_LAG(1, 3)", None)]);
        let signals = evaluate_spec(&spec, &panels);
        assert!(signals[0].panel.value(10, 1).is_nan());
        assert!(signals[0].panel.value(10, 0).is_finite());
    }

    #[test]
    fn sum_alias_matches_roll_sum() {
        let panels = trending_market();
        let spec = spec(&[
            ("alias", "SUM(RET_D(1), 4)", None),
            ("named", "ROLL_SUM(RET_D(1), 4)", None),
        ]);
        let signals = evaluate_spec(&spec, &panels);
        assert!(signals[0].panel.identical(&signals[1].panel));
        assert!(signals[0].panel.value(10, 0).is_finite());
    }

    #[test]
    fn trend_regime_reads_each_instrument_direction() {
        let panels = trending_market();
        let spec = spec(&[("trend", "REGIME_TREND(PRICE(1), 3, 8)", None)]);
        let panel = &evaluate_spec(&spec, &panels)[0].panel;
        assert!(panel.value(7, 0).is_nan());
        assert_eq!(panel.value(8, 0), 1.0);
        assert_eq!(panel.value(20, 1), 0.0);
        assert_eq!(panel.value(20, 2), -1.0);
    }

    #[test]
    fn shape_primitives_evaluate_per_instrument() {
        let panels = trending_market();
        let spec = spec(&[
            ("peak", "TS_ARGMAX(PRICE(1), 5)", None),
            ("trough", "TS_ARGMIN(PRICE(1), 5)", None),
            ("growth", "PRODUCT(1 + RET_D(1), 3)", None),
            ("recovery", "DRAWDOWN_RECOVERY(PRICE(1), 5)", None),
            ("twin", "CORRELATION_DECAY(PRICE(1), PRICE(2), 5, 0.9)", None),
            ("regime", "REGIME_VOLATILITY(RET_D(1), 3, 0.2, 5)", None),
        ]);
        let signals = evaluate_spec(&spec, &panels);
        // rising first instrument peaks today and bottoms four periods back
        assert_eq!(signals[0].panel.value(15, 0), 0.0);
        assert_eq!(signals[1].panel.value(15, 0), 4.0);
        assert_eq!(signals[0].panel.value(15, 2), 4.0);
        assert!((signals[2].panel.value(15, 0) - 1.01f64.powi(3)).abs() < 1e-9);
        // a new high every day: no drawdown to recover from
        assert!(signals[3].panel.value(15, 0).abs() < 1e-12);
        assert!((signals[4].panel.value(15, 0) - 1.0).abs() < 1e-9);
        // a flat price has zero volatility, which is also its median
        assert_eq!(signals[5].panel.value(15, 1), 0.0);
        assert!(signals[5].panel.value(5, 1).is_nan());
    }

    #[test]
    fn unknown_primitive_names_the_signal() {
        let spec = spec(&[("bad", "FOO(RET_D(1), 3)", None)]);
        match compile_signals(&spec) {
            Err(EngineError::SignalConfiguration {
                signal_id, expr, ..
            }) => {
                assert_eq!(signal_id, "bad");
                assert_eq!(expr, "FOO(RET_D(1), 3)");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn zero_lag_return_fails_at_evaluation() {
        let panels = trending_market();
        let spec = spec(&[("peek", "RET_LAG(0, 5)", None)]);
        let compiled = compile_signals(&spec).unwrap();
        let result = SignalEvaluator::new(&panels, 0.001, 252.0).evaluate_all(&compiled);
        assert!(matches!(
            result,
            Err(EngineError::SignalConfiguration { signal_id, .. }) if signal_id == "peek"
        ));
    }

    #[test]
    fn composite_follows_portfolio_selection() {
        let panels = trending_market();
        let mut spec = spec(&[("a", "RET_LAG(1, 3)", None), ("b", "a * 3", None)]);
        let signals = evaluate_spec(&spec, &panels);

        let last = composite_signal(&signals, &spec.portfolio).unwrap();
        assert!(last.identical(&signals[1].panel));

        spec.portfolio.combine = SignalCombine::Mean;
        let mean = composite_signal(&signals, &spec.portfolio).unwrap();
        let expected = signals[0].panel.value(10, 0) * 2.0;
        assert!((mean.value(10, 0) - expected).abs() < 1e-12);

        spec.portfolio.signal = Some("a".to_string());
        let named = composite_signal(&signals, &spec.portfolio).unwrap();
        assert!(named.identical(&signals[0].panel));
    }
}
