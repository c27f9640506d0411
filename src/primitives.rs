//! Column and row transforms behind the expression language.
//!
//! Time-series functions take one instrument's history (oldest first) and
//! return a series of the same length. A window containing a missing value
//! yields a missing output, and the first `window - 1` outputs are missing.
//! Cross-sectional functions take one date's row and only look at that row.

use crate::error::{EngineError, EngineResult};
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::cmp::Ordering;

/// Floor for log inputs.
pub const LOG_CLIP: f64 = 1e-10;

fn complete_window(values: &[f64], t: usize, window: usize) -> Option<&[f64]> {
    if window == 0 || t + 1 < window {
        return None;
    }
    let slice = &values[t + 1 - window..=t];
    if slice.iter().all(|v| v.is_finite()) {
        Some(slice)
    } else {
        None
    }
}

fn rolling_apply(values: &[f64], window: usize, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    (0..values.len())
        .map(|t| complete_window(values, t, window).map_or(f64::NAN, &f))
        .collect()
}

/// Return over `window` periods ending `lag` periods before each date.
pub fn lagged_return(prices: &[f64], lag: usize, window: usize) -> EngineResult<Vec<f64>> {
    if lag < 1 {
        return Err(EngineError::configuration(format!(
            "RET_LAG lag must be >= 1 (value: {})",
            lag
        )));
    }
    if window < 1 {
        return Err(EngineError::configuration(format!(
            "RET_LAG window must be >= 1 (value: {})",
            window
        )));
    }
    let mut out = vec![f64::NAN; prices.len()];
    for (t, slot) in out.iter_mut().enumerate() {
        if t < lag.saturating_add(window) {
            continue;
        }
        let end = prices[t - lag];
        let start = prices[t - lag - window];
        if end.is_finite() && start.is_finite() && start > 0.0 {
            *slot = end / start - 1.0;
        }
    }
    Ok(out)
}

/// Value `periods` dates earlier.
pub fn shift(values: &[f64], periods: usize) -> Vec<f64> {
    (0..values.len())
        .map(|t| {
            if t >= periods {
                values[t - periods]
            } else {
                f64::NAN
            }
        })
        .collect()
}

pub fn delta(values: &[f64], periods: usize) -> Vec<f64> {
    (0..values.len())
        .map(|t| {
            if t >= periods {
                values[t] - values[t - periods]
            } else {
                f64::NAN
            }
        })
        .collect()
}

pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    rolling_apply(values, window, |w| w.mean())
}

pub fn rolling_sum(values: &[f64], window: usize) -> Vec<f64> {
    rolling_apply(values, window, |w| w.iter().sum())
}

/// Trailing sample standard deviation.
pub fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    if window < 2 {
        return vec![f64::NAN; values.len()];
    }
    rolling_apply(values, window, |w| w.std_dev())
}

pub fn rolling_max(values: &[f64], window: usize) -> Vec<f64> {
    rolling_apply(values, window, |w| {
        w.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    })
}

pub fn rolling_min(values: &[f64], window: usize) -> Vec<f64> {
    rolling_apply(values, window, |w| w.iter().copied().fold(f64::INFINITY, f64::min))
}

/// Percentile rank of the newest value inside its trailing window.
pub fn ts_rank(values: &[f64], window: usize) -> Vec<f64> {
    rolling_apply(values, window, |w| {
        let ranks = average_ranks(w);
        ranks[ranks.len() - 1] / w.len() as f64
    })
}

pub fn ts_zscore(values: &[f64], window: usize, epsilon: f64) -> Vec<f64> {
    if window < 2 {
        return vec![f64::NAN; values.len()];
    }
    rolling_apply(values, window, |w| {
        let mean = w.mean();
        let std = w.std_dev();
        (w[w.len() - 1] - mean) / std.max(epsilon)
    })
}

/// Linearly weighted mean; the newest value carries weight `window`.
pub fn decay_linear(values: &[f64], window: usize) -> Vec<f64> {
    let n = window as f64;
    let denominator = n * (n + 1.0) / 2.0;
    rolling_apply(values, window, |w| {
        w.iter()
            .enumerate()
            .map(|(i, v)| v * (i + 1) as f64)
            .sum::<f64>()
            / denominator
    })
}

pub fn rolling_product(values: &[f64], window: usize) -> Vec<f64> {
    rolling_apply(values, window, |w| w.iter().product())
}

/// Mean and population central moments of order two to four.
fn central_moments(w: &[f64]) -> (f64, f64, f64) {
    let mean = w.mean();
    let n = w.len() as f64;
    let (m2, m3, m4) = w.iter().fold((0.0, 0.0, 0.0), |(m2, m3, m4), v| {
        let d = v - mean;
        (m2 + d * d, m3 + d * d * d, m4 + d * d * d * d)
    });
    (m2 / n, m3 / n, m4 / n)
}

fn is_flat(w: &[f64]) -> bool {
    w.iter().all(|v| *v == w[0])
}

/// Bias-adjusted sample skewness. Flat windows are missing.
pub fn rolling_skew(values: &[f64], window: usize) -> Vec<f64> {
    if window < 3 {
        return vec![f64::NAN; values.len()];
    }
    rolling_apply(values, window, |w| {
        if is_flat(w) {
            return f64::NAN;
        }
        let n = w.len() as f64;
        let (m2, m3, _) = central_moments(w);
        (n * (n - 1.0)).sqrt() / (n - 2.0) * m3 / m2.powf(1.5)
    })
}

/// Bias-adjusted sample excess kurtosis. Flat windows are missing.
pub fn rolling_kurtosis(values: &[f64], window: usize) -> Vec<f64> {
    if window < 4 {
        return vec![f64::NAN; values.len()];
    }
    rolling_apply(values, window, |w| {
        if is_flat(w) {
            return f64::NAN;
        }
        let n = w.len() as f64;
        let (m2, _, m4) = central_moments(w);
        let g2 = m4 / (m2 * m2) - 3.0;
        ((n + 1.0) * g2 + 6.0) * (n - 1.0) / ((n - 2.0) * (n - 3.0))
    })
}

/// Periods since the window's first maximum; 0 when the newest value is it.
pub fn ts_argmax(values: &[f64], window: usize) -> Vec<f64> {
    rolling_apply(values, window, |w| {
        let best = (0..w.len()).fold(0, |best, i| if w[i] > w[best] { i } else { best });
        (w.len() - 1 - best) as f64
    })
}

pub fn ts_argmin(values: &[f64], window: usize) -> Vec<f64> {
    rolling_apply(values, window, |w| {
        let best = (0..w.len()).fold(0, |best, i| if w[i] < w[best] { i } else { best });
        (w.len() - 1 - best) as f64
    })
}

/// Daily change of the drawdown from the trailing `window` peak. Positive
/// while recovering, missing when the peak is not positive.
pub fn drawdown_recovery(values: &[f64], window: usize) -> Vec<f64> {
    let drawdown: Vec<f64> = values
        .iter()
        .zip(rolling_max(values, window))
        .map(|(value, peak)| {
            if peak > 0.0 {
                value / peak - 1.0
            } else {
                f64::NAN
            }
        })
        .collect();
    delta(&drawdown, 1)
}

/// Volatility regime against the median of the trailing `history` volatility
/// readings: 1 above `median * (1 + threshold)`, -1 below
/// `median * (1 - threshold)`, otherwise 0.
pub fn volatility_regime(
    values: &[f64],
    window: usize,
    threshold: f64,
    history: usize,
) -> Vec<f64> {
    let volatility = rolling_std(values, window);
    rolling_apply(&volatility, history, |w| {
        let current = w[w.len() - 1];
        let median = Data::new(w.to_vec()).quantile(0.5);
        if current > median * (1.0 + threshold) {
            1.0
        } else if current < median * (1.0 - threshold) {
            -1.0
        } else {
            0.0
        }
    })
}

/// Sign of the `short` moving average minus the `long` one.
pub fn trend_regime(values: &[f64], short: usize, long: usize) -> Vec<f64> {
    rolling_mean(values, short)
        .into_iter()
        .zip(rolling_mean(values, long))
        .map(|(fast, slow)| {
            if fast.is_nan() || slow.is_nan() {
                f64::NAN
            } else if fast > slow {
                1.0
            } else if fast < slow {
                -1.0
            } else {
                0.0
            }
        })
        .collect()
}

fn rolling_pair(
    left: &[f64],
    right: &[f64],
    window: usize,
    f: impl Fn(&[f64], &[f64]) -> Option<f64>,
) -> Vec<f64> {
    (0..left.len().min(right.len()))
        .map(|t| {
            match (
                complete_window(left, t, window),
                complete_window(right, t, window),
            ) {
                (Some(a), Some(b)) => f(a, b).unwrap_or(f64::NAN),
                _ => f64::NAN,
            }
        })
        .collect()
}

pub fn rolling_correlation(left: &[f64], right: &[f64], window: usize) -> Vec<f64> {
    rolling_pair(left, right, window, pearson)
}

pub fn rolling_covariance(left: &[f64], right: &[f64], window: usize) -> Vec<f64> {
    rolling_pair(left, right, window, |a, b| {
        if a.len() < 2 {
            return None;
        }
        let mean_a = a.mean();
        let mean_b = b.mean();
        let sum: f64 = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x - mean_a) * (y - mean_b))
            .sum();
        Some(sum / (a.len() - 1) as f64)
    })
}

/// Rolling correlation where the value `k` periods old carries weight
/// `decay^k`. A decay of 1 is the plain rolling correlation.
pub fn decayed_correlation(left: &[f64], right: &[f64], window: usize, decay: f64) -> Vec<f64> {
    let n = left.len().min(right.len());
    if window > n {
        return vec![f64::NAN; n];
    }
    let weights: Vec<f64> = (0..window)
        .map(|i| decay.powf((window - 1 - i) as f64))
        .collect();
    rolling_pair(left, right, window, |a, b| weighted_pearson(a, b, &weights))
}

fn weighted_pearson(x: &[f64], y: &[f64], weights: &[f64]) -> Option<f64> {
    let total: f64 = weights.iter().sum();
    if x.len() < 2 || total <= 0.0 {
        return None;
    }
    let mean_x = x.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total;
    let mean_y = y.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for ((a, b), w) in x.iter().zip(y).zip(weights) {
        let (dx, dy) = (a - mean_x, b - mean_y);
        cov += w * dx * dy;
        var_x += w * dx * dx;
        var_y += w * dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    Some((cov / (var_x * var_y).sqrt()).clamp(-1.0, 1.0))
}

/// Annualized trailing volatility of returns observed `lag` periods back.
pub fn trailing_volatility(
    returns: &[f64],
    window: usize,
    lag: usize,
    periods_per_year: f64,
) -> Vec<f64> {
    let lagged = shift(returns, lag);
    rolling_std(&lagged, window)
        .into_iter()
        .map(|std| std * periods_per_year.sqrt())
        .collect()
}

fn present_values(row: &[f64]) -> Vec<f64> {
    row.iter().copied().filter(|v| v.is_finite()).collect()
}

/// Cross-sectional z-score. Needs two present values; dispersion below
/// `epsilon` is floored so flat rows map to zero.
pub fn cs_zscore(row: &[f64], epsilon: f64) -> Vec<f64> {
    let present = present_values(row);
    if present.len() < 2 {
        return vec![f64::NAN; row.len()];
    }
    let mean = present.iter().mean();
    let std = present.iter().std_dev().max(epsilon);
    row.iter()
        .map(|v| if v.is_finite() { (v - mean) / std } else { f64::NAN })
        .collect()
}

/// Cross-sectional percentile rank in (0, 1], ties averaged.
pub fn cs_rank(row: &[f64]) -> Vec<f64> {
    let present = present_values(row);
    if present.len() < 2 {
        return vec![f64::NAN; row.len()];
    }
    let ranks = average_ranks(&present);
    let n = present.len() as f64;
    let mut ranked = ranks.into_iter();
    row.iter()
        .map(|v| {
            if v.is_finite() {
                ranked.next().map_or(f64::NAN, |r| r / n)
            } else {
                f64::NAN
            }
        })
        .collect()
}

pub fn cs_demean(row: &[f64]) -> Vec<f64> {
    let present = present_values(row);
    if present.len() < 2 {
        return vec![f64::NAN; row.len()];
    }
    let mean = present.iter().mean();
    row.iter()
        .map(|v| if v.is_finite() { v - mean } else { f64::NAN })
        .collect()
}

/// Scales the row so absolute values sum to one.
pub fn cs_scale(row: &[f64]) -> Vec<f64> {
    let gross: f64 = row.iter().filter(|v| v.is_finite()).map(|v| v.abs()).sum();
    if gross <= f64::EPSILON {
        return vec![f64::NAN; row.len()];
    }
    row.iter()
        .map(|v| if v.is_finite() { v / gross } else { f64::NAN })
        .collect()
}

pub fn clipped_log(value: f64) -> f64 {
    if value.is_finite() {
        value.max(LOG_CLIP).ln()
    } else {
        f64::NAN
    }
}

pub fn signed_power(value: f64, exponent: f64) -> f64 {
    value.signum() * value.abs().powf(exponent)
}

/// 1-based ranks with ties sharing their average rank.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|a, b| {
        values[*a]
            .partial_cmp(&values[*b])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(b))
    });

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Pearson correlation; `None` when undefined (short input or no dispersion).
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (xi, yi) in x.iter().zip(y.iter()) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    let corr = cov / (var_x * var_y).sqrt();
    Some(corr.clamp(-1.0, 1.0))
}

pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    pearson(&average_ranks(x), &average_ranks(y))
}

/// Pairs of values present in both rows.
pub fn paired_present(left: &[f64], right: &[f64]) -> (Vec<f64>, Vec<f64>) {
    left.iter()
        .zip(right.iter())
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(a, b)| (*a, *b))
        .unzip()
}
