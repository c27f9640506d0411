use crate::config::{EngineConfig, IcMethod};
use crate::models::{
    CoreMetrics, DatedValue, DecayDiagnostics, DrawdownProfile, MetricsBundle, PortfolioReturns,
    RegimeBreakdown, RegimeStats, RiskMetrics, StabilityMetrics,
};
use crate::panel::Panel;
use crate::primitives::{paired_present, pearson, spearman};
use chrono::{Datelike, NaiveDate};
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

/// Dispersion below this is treated as none at all.
const MIN_DISPERSION: f64 = 1e-12;

/// Cross-sectional correlation between one date's scores and one date's
/// returns, over the instruments present in both. `None` with fewer than two
/// pairs or no dispersion.
pub fn information_coefficient(
    scores: &[f64],
    returns: &[f64],
    method: IcMethod,
) -> Option<f64> {
    let (x, y) = paired_present(scores, returns);
    match method {
        IcMethod::Spearman => spearman(&x, &y),
        IcMethod::Pearson => pearson(&x, &y),
    }
}

/// IC of the signal decided at each `t` in `decisions` against the returns of
/// `t + 1`, dated on the return date.
pub fn ic_series(
    signal: &Panel,
    returns: &Panel,
    decisions: Range<usize>,
    method: IcMethod,
) -> Vec<DatedValue> {
    let n_dates = signal.n_dates().min(returns.n_dates());
    decisions
        .filter(|t| t + 1 < n_dates)
        .filter_map(|t| {
            information_coefficient(signal.row(t), returns.row(t + 1), method).map(|value| {
                DatedValue {
                    date: returns.dates()[t + 1],
                    value,
                }
            })
        })
        .collect()
}

/// Everything the metrics stage needs from a finished backtest.
pub struct MetricsInputs<'a> {
    pub returns: &'a PortfolioReturns,
    pub ic: &'a [DatedValue],
    /// Instrument returns; the equal-weight mean is the market proxy for regimes.
    pub market: &'a Panel,
    /// `(sharpe, avg_ic)` of each completed split.
    pub split_scores: &'a [(f64, f64)],
    pub periods_per_year: f64,
    pub config: &'a EngineConfig,
}

pub struct MetricsCalculator;

impl MetricsCalculator {
    pub fn compute(inputs: &MetricsInputs<'_>) -> MetricsBundle {
        let MetricsInputs {
            returns,
            ic,
            market,
            split_scores,
            periods_per_year,
            config,
        } = inputs;
        let ppy = *periods_per_year;
        let rf = config.risk_free_rate;
        let net = returns.net();
        if net.is_empty() {
            return MetricsBundle::default();
        }

        let ic_values: Vec<f64> = ic.iter().map(|v| v.value).collect();
        let (avg_ic, ic_std, ir, hit_rate) = Self::ic_summary(&ic_values);
        let maxdd = Self::max_drawdown(&net);
        let ann_ret = Self::annualized_return(&net, ppy);
        let (skew, kurtosis) = Self::moments(&net);

        let core = CoreMetrics {
            sharpe: Self::sharpe_ratio(&net, ppy, rf),
            ann_ret,
            ann_vol: Self::annualized_volatility(&net, ppy),
            maxdd,
            avg_ic,
            ic_std,
            ir,
            hit_rate,
            turnover_monthly: Self::monthly_turnover(returns),
            sortino: Self::sortino_ratio(&net, ppy, rf),
            calmar: Self::calmar_ratio(ann_ret, maxdd),
            skew,
            kurtosis,
            days: net.len(),
            ic_days: ic_values.len(),
        };

        let rolling_ic = Self::rolling_mean(ic, config.rolling_ic_window);
        let stability_series = Self::rolling_sharpe(returns, config.stability_window, ppy, rf);
        let stability_values: Vec<f64> = stability_series.iter().map(|v| v.value).collect();
        let split_sharpes: Vec<f64> = split_scores.iter().map(|(sharpe, _)| *sharpe).collect();
        let split_ics: Vec<f64> = split_scores.iter().map(|(_, ic)| *ic).collect();
        let (split_sharpe_mean, split_sharpe_std) = mean_and_std(&split_sharpes);
        let (split_ic_mean, split_ic_std) = mean_and_std(&split_ics);

        let stability = StabilityMetrics {
            rolling_sharpe: Self::rolling_sharpe(returns, config.rolling_sharpe_window, ppy, rf),
            rolling_ic: rolling_ic.clone(),
            split_sharpe_mean,
            split_sharpe_std,
            split_ic_mean,
            split_ic_std,
            rolling_sharpe_drawdown: Self::rolling_sharpe_drawdown(&stability_values),
        };

        MetricsBundle {
            risk: Self::risk_metrics(&net),
            drawdown: Self::drawdown_profile(&net),
            stability,
            regimes: Self::regime_breakdown(returns, ic, market, avg_ic, ppy, config),
            decay: Self::decay(returns, ic, &rolling_ic, ppy, rf),
            core,
        }
    }

    /// Annualized Sharpe ratio using the sample standard deviation. Zero when
    /// the series is too short or has no dispersion.
    pub fn sharpe_ratio(returns: &[f64], periods_per_year: f64, risk_free_rate: f64) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let mean = returns.iter().mean();
        let std = returns.iter().std_dev();
        if !(std.is_finite() && std > MIN_DISPERSION) {
            return 0.0;
        }
        (mean * periods_per_year - risk_free_rate) / (std * periods_per_year.sqrt())
    }

    pub fn annualized_return(returns: &[f64], periods_per_year: f64) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }
        returns.iter().mean() * periods_per_year
    }

    pub fn annualized_volatility(returns: &[f64], periods_per_year: f64) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        returns.iter().std_dev() * periods_per_year.sqrt()
    }

    /// Worst peak-to-trough decline of compounded equity; zero or negative.
    pub fn max_drawdown(returns: &[f64]) -> f64 {
        drawdown_series(returns)
            .into_iter()
            .fold(0.0, |worst, dd| if dd < worst { dd } else { worst })
    }

    pub fn drawdown_profile(returns: &[f64]) -> DrawdownProfile {
        let series = drawdown_series(returns);
        if series.is_empty() {
            return DrawdownProfile::default();
        }

        let underwater: Vec<f64> = series.iter().copied().filter(|dd| *dd < 0.0).collect();
        let avg_drawdown = if underwater.is_empty() {
            0.0
        } else {
            underwater.iter().sum::<f64>() / underwater.len() as f64
        };

        let mut longest = 0;
        let mut current = 0;
        for dd in &series {
            if *dd < 0.0 {
                current += 1;
                longest = longest.max(current);
            } else {
                current = 0;
            }
        }

        let (trough, max_drawdown) = series
            .iter()
            .copied()
            .enumerate()
            .fold((0, 0.0), |(at, worst), (i, dd)| {
                if dd < worst {
                    (i, dd)
                } else {
                    (at, worst)
                }
            });
        let recovery_days = if max_drawdown < 0.0 {
            series[trough..].iter().position(|dd| *dd >= 0.0)
        } else {
            Some(0)
        };

        DrawdownProfile {
            max_drawdown,
            avg_drawdown,
            longest_duration_days: longest,
            recovery_days,
        }
    }

    pub fn sortino_ratio(returns: &[f64], periods_per_year: f64, risk_free_rate: f64) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>()
            / returns.len() as f64)
            .sqrt();
        if downside <= MIN_DISPERSION {
            return 0.0;
        }
        let mean = returns.iter().mean();
        (mean * periods_per_year - risk_free_rate) / (downside * periods_per_year.sqrt())
    }

    pub fn calmar_ratio(annualized_return: f64, max_drawdown: f64) -> f64 {
        if max_drawdown.abs() <= MIN_DISPERSION {
            0.0
        } else {
            annualized_return / max_drawdown.abs()
        }
    }

    /// Skewness and excess kurtosis from population moments.
    pub fn moments(returns: &[f64]) -> (f64, f64) {
        if returns.len() < 3 {
            return (0.0, 0.0);
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
        for r in returns {
            let d = r - mean;
            m2 += d * d;
            m3 += d * d * d;
            m4 += d * d * d * d;
        }
        m2 /= n;
        m3 /= n;
        m4 /= n;
        if m2 <= MIN_DISPERSION * MIN_DISPERSION {
            return (0.0, 0.0);
        }
        (m3 / m2.powf(1.5), m4 / (m2 * m2) - 3.0)
    }

    pub fn risk_metrics(returns: &[f64]) -> RiskMetrics {
        if returns.is_empty() {
            return RiskMetrics::default();
        }
        let mut data = Data::new(returns.to_vec());
        let q05 = data.quantile(0.05);
        let q95 = data.quantile(0.95);
        let tail: Vec<f64> = returns.iter().copied().filter(|r| *r <= q05).collect();
        let cvar_95 = if tail.is_empty() {
            q05
        } else {
            tail.iter().sum::<f64>() / tail.len() as f64
        };
        let tail_ratio = if q05.abs() <= MIN_DISPERSION {
            0.0
        } else {
            q95.abs() / q05.abs()
        };
        RiskMetrics {
            var_95: q05,
            cvar_95,
            tail_ratio,
        }
    }

    /// Mean IC, its sample standard deviation, information ratio and hit rate.
    pub fn ic_summary(ic: &[f64]) -> (f64, f64, f64, f64) {
        if ic.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }
        let (avg, std) = mean_and_std(ic);
        let ir = if std > MIN_DISPERSION { avg / std } else { 0.0 };
        let hits = ic.iter().filter(|v| **v > 0.0).count();
        (avg, std, ir, hits as f64 / ic.len() as f64)
    }

    /// Mean over calendar months of summed daily turnover, in percent of notional.
    pub fn monthly_turnover(returns: &PortfolioReturns) -> f64 {
        let mut months: BTreeMap<(i32, u32), f64> = BTreeMap::new();
        for record in &returns.records {
            *months
                .entry((record.date.year(), record.date.month()))
                .or_insert(0.0) += record.turnover;
        }
        if months.is_empty() {
            return 0.0;
        }
        months.values().sum::<f64>() / months.len() as f64 * 100.0
    }

    pub fn rolling_sharpe(
        returns: &PortfolioReturns,
        window: usize,
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> Vec<DatedValue> {
        let net = returns.net();
        if window < 2 || net.len() < window {
            return Vec::new();
        }
        (window - 1..net.len())
            .map(|i| DatedValue {
                date: returns.records[i].date,
                value: Self::sharpe_ratio(&net[i + 1 - window..=i], periods_per_year, risk_free_rate),
            })
            .collect()
    }

    pub fn rolling_mean(series: &[DatedValue], window: usize) -> Vec<DatedValue> {
        if window == 0 || series.len() < window {
            return Vec::new();
        }
        (window - 1..series.len())
            .map(|i| DatedValue {
                date: series[i].date,
                value: series[i + 1 - window..=i].iter().map(|v| v.value).sum::<f64>()
                    / window as f64,
            })
            .collect()
    }

    /// Largest relative fall of a rolling-Sharpe series from its running
    /// positive peak.
    pub fn rolling_sharpe_drawdown(values: &[f64]) -> f64 {
        let mut peak = f64::NEG_INFINITY;
        let mut worst: f64 = 0.0;
        for value in values {
            peak = peak.max(*value);
            if peak > 0.0 {
                worst = worst.max((peak - value) / peak);
            }
        }
        worst
    }

    pub fn regime_breakdown(
        returns: &PortfolioReturns,
        ic: &[DatedValue],
        market: &Panel,
        avg_ic: f64,
        periods_per_year: f64,
        config: &EngineConfig,
    ) -> RegimeBreakdown {
        let proxy: Vec<f64> = (0..market.n_dates())
            .map(|t| {
                let present: Vec<f64> =
                    market.row(t).iter().copied().filter(|v| v.is_finite()).collect();
                if present.is_empty() {
                    f64::NAN
                } else {
                    present.iter().sum::<f64>() / present.len() as f64
                }
            })
            .collect();
        let position: HashMap<NaiveDate, usize> = market
            .dates()
            .iter()
            .enumerate()
            .map(|(t, date)| (*date, t))
            .collect();
        let ic_by_date: HashMap<NaiveDate, f64> =
            ic.iter().map(|v| (v.date, v.value)).collect();

        let trailing = |t: usize, window: usize| -> Option<&[f64]> {
            if window == 0 || t < window {
                return None;
            }
            let slice = &proxy[t - window..t];
            slice.iter().all(|v| v.is_finite()).then_some(slice)
        };

        let mut trend = Vec::with_capacity(returns.len());
        let mut vol = Vec::with_capacity(returns.len());
        for record in &returns.records {
            let t = position.get(&record.date).copied();
            trend.push(
                t.and_then(|t| trailing(t, config.regime_trend_window))
                    .map(|window| window.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0),
            );
            vol.push(
                t.and_then(|t| trailing(t, config.regime_vol_window))
                    .filter(|window| window.len() >= 2)
                    .map(|window| window.iter().std_dev()),
            );
        }

        let mut observed: Vec<f64> = vol.iter().flatten().copied().collect();
        let median_vol = median(&mut observed);

        let stats = |selected: &dyn Fn(usize) -> bool| -> RegimeStats {
            let mut net = Vec::new();
            let mut ics = Vec::new();
            for (i, record) in returns.records.iter().enumerate() {
                if selected(i) {
                    net.push(record.net);
                    if let Some(value) = ic_by_date.get(&record.date) {
                        ics.push(*value);
                    }
                }
            }
            RegimeStats {
                days: net.len(),
                sharpe: Self::sharpe_ratio(&net, periods_per_year, config.risk_free_rate),
                ann_ret: Self::annualized_return(&net, periods_per_year),
                avg_ic: mean_and_std(&ics).0,
            }
        };

        let bull = stats(&|i| matches!(trend[i], Some(r) if r > 0.0));
        let bear = stats(&|i| matches!(trend[i], Some(r) if r < 0.0));
        let high_vol = stats(&|i| matches!((vol[i], median_vol), (Some(v), Some(m)) if v > m));
        let low_vol = stats(&|i| matches!((vol[i], median_vol), (Some(v), Some(m)) if v <= m));

        let robustness =
            1.0 - ((high_vol.avg_ic - low_vol.avg_ic).abs() / (avg_ic.abs() + 0.01)).min(1.0);

        RegimeBreakdown {
            bull,
            bear,
            high_vol,
            low_vol,
            robustness,
        }
    }

    /// Compares the first and second half of the scored period.
    pub fn decay(
        returns: &PortfolioReturns,
        ic: &[DatedValue],
        rolling_ic: &[DatedValue],
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> DecayDiagnostics {
        let net = returns.net();
        if net.len() < 2 {
            return DecayDiagnostics::default();
        }
        let half = net.len() / 2;
        let boundary = returns.records[half].date;

        let early_sharpe = Self::sharpe_ratio(&net[..half], periods_per_year, risk_free_rate);
        let late_sharpe = Self::sharpe_ratio(&net[half..], periods_per_year, risk_free_rate);
        let (early_ic_values, late_ic_values): (Vec<f64>, Vec<f64>) = {
            let (early, late): (Vec<&DatedValue>, Vec<&DatedValue>) =
                ic.iter().partition(|v| v.date < boundary);
            (
                early.iter().map(|v| v.value).collect(),
                late.iter().map(|v| v.value).collect(),
            )
        };
        let early_ic = mean_and_std(&early_ic_values).0;
        let late_ic = mean_and_std(&late_ic_values).0;

        DecayDiagnostics {
            early_sharpe,
            late_sharpe,
            sharpe_decay_rate: decay_rate(early_sharpe, late_sharpe),
            early_ic,
            late_ic,
            ic_decay_rate: decay_rate(early_ic, late_ic),
            ic_half_life: Self::ic_half_life(rolling_ic),
        }
    }

    /// Half-life (in periods) of the absolute rolling IC from a log-linear
    /// fit. Only defined when the fit slopes down.
    pub fn ic_half_life(rolling_ic: &[DatedValue]) -> Option<f64> {
        let points: Vec<(f64, f64)> = rolling_ic
            .iter()
            .enumerate()
            .filter(|(_, v)| v.value.abs() > MIN_DISPERSION)
            .map(|(i, v)| (i as f64, v.value.abs().ln()))
            .collect();
        if points.len() < 3 {
            return None;
        }
        let n = points.len() as f64;
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let (mut sxy, mut sxx) = (0.0, 0.0);
        for (x, y) in &points {
            sxy += (x - mean_x) * (y - mean_y);
            sxx += (x - mean_x) * (x - mean_x);
        }
        if sxx <= 0.0 {
            return None;
        }
        let slope = sxy / sxx;
        if slope < 0.0 {
            Some(std::f64::consts::LN_2 / -slope)
        } else {
            None
        }
    }
}

fn drawdown_series(returns: &[f64]) -> Vec<f64> {
    let mut equity = 1.0;
    let mut peak: f64 = 1.0;
    returns
        .iter()
        .map(|r| {
            equity *= 1.0 + r;
            peak = peak.max(equity);
            equity / peak - 1.0
        })
        .collect()
}

fn decay_rate(early: f64, late: f64) -> f64 {
    if early.abs() <= MIN_DISPERSION {
        0.0
    } else {
        (early - late) / early.abs()
    }
}

/// Mean and sample standard deviation; zeros for empty input and a zero
/// deviation for a single value.
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    match values.len() {
        0 => (0.0, 0.0),
        1 => (values[0], 0.0),
        _ => (values.iter().mean(), values.iter().std_dev()),
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
