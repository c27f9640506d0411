use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{Frequency, LegWeighting, PortfolioDef, PortfolioReturn, PortfolioScheme};
use crate::panel::Panel;
use crate::primitives::average_ranks;
use crate::splitter::Split;
use chrono::{Datelike, NaiveDate};
use std::cmp::Ordering;

/// Spread below which a row of scores is treated as carrying no ranking.
const MIN_SCORE_SPREAD: f64 = 1e-12;
const QUINTILE_FRACTION: f64 = 0.2;
/// Keeps min-max normalised leg scores away from a zero denominator.
const SCORE_RANGE_FLOOR: f64 = 1e-10;

/// What a rebalance date decided.
#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceOutcome {
    Book(Vec<f64>),
    /// Enough instruments were scored but every score was the same.
    NoDispersion,
    TooFewInstruments { present: usize },
}

impl RebalanceOutcome {
    pub fn is_rankable(&self) -> bool {
        !matches!(self, Self::TooFewInstruments { .. })
    }
}

/// Result of trading one test window.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitBacktest {
    pub returns: Vec<PortfolioReturn>,
    pub rebalances: usize,
    pub missing_return_days: usize,
}

/// Whether `date` opens a new rebalance period after `previous`.
pub fn starts_period(calendar: Frequency, previous: Option<NaiveDate>, date: NaiveDate) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    match calendar {
        Frequency::Daily => true,
        Frequency::Weekly => previous.iso_week() != date.iso_week(),
        Frequency::Monthly => (previous.year(), previous.month()) != (date.year(), date.month()),
    }
}

pub struct PortfolioConstructor<'a> {
    portfolio: &'a PortfolioDef,
    config: &'a EngineConfig,
    periods_per_year: f64,
}

impl<'a> PortfolioConstructor<'a> {
    pub fn new(portfolio: &'a PortfolioDef, config: &'a EngineConfig, periods_per_year: f64) -> Self {
        Self {
            portfolio,
            config,
            periods_per_year,
        }
    }

    /// Target weights for one date's scores. An instrument is ranked only
    /// when both its score and its price on that date are present.
    pub fn target_weights(&self, scores: &[f64], prices: &[f64]) -> RebalanceOutcome {
        let candidates: Vec<usize> = (0..scores.len())
            .filter(|j| {
                scores[*j].is_finite() && prices.get(*j).map_or(false, |p| p.is_finite())
            })
            .collect();
        let n = candidates.len();
        if n < 2 {
            return RebalanceOutcome::TooFewInstruments { present: n };
        }
        let (low, high) = candidates
            .iter()
            .map(|j| scores[*j])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(s), hi.max(s))
            });
        if high - low <= MIN_SCORE_SPREAD {
            return RebalanceOutcome::NoDispersion;
        }

        let half = self.portfolio.notional / 2.0;
        let mut weights = vec![0.0; scores.len()];
        match self.portfolio.scheme {
            PortfolioScheme::LongShortDeciles | PortfolioScheme::LongShortQuintiles => {
                let fraction = if self.portfolio.scheme == PortfolioScheme::LongShortDeciles {
                    self.config.decile_fraction
                } else {
                    QUINTILE_FRACTION
                };
                let leg = ((n as f64 * fraction).floor() as usize).max(1).min(n / 2);

                // highest score first; equal scores keep instrument order
                let mut order = candidates;
                order.sort_by(|a, b| {
                    scores[*b]
                        .partial_cmp(&scores[*a])
                        .unwrap_or(Ordering::Equal)
                        .then(a.cmp(b))
                });
                let longs = &order[..leg];
                let shorts = &order[n - leg..];
                self.fill_leg(&mut weights, scores, longs, half, false);
                self.fill_leg(&mut weights, scores, shorts, -half, true);
            }
            PortfolioScheme::RankWeighted => {
                let present: Vec<f64> = candidates.iter().map(|j| scores[*j]).collect();
                let ranks = average_ranks(&present);
                let mean_rank = (n as f64 + 1.0) / 2.0;
                let centered: Vec<f64> = ranks.iter().map(|r| r - mean_rank).collect();
                let long_total: f64 = centered.iter().filter(|c| **c > 0.0).sum();
                let short_total: f64 = centered.iter().filter(|c| **c < 0.0).map(|c| -c).sum();
                if long_total <= 0.0 || short_total <= 0.0 {
                    return RebalanceOutcome::NoDispersion;
                }
                for (j, c) in candidates.iter().zip(centered.iter()) {
                    weights[*j] = if *c > 0.0 {
                        half * c / long_total
                    } else {
                        half * c / short_total
                    };
                }
            }
        }

        RebalanceOutcome::Book(self.apply_limits(weights))
    }

    fn fill_leg(&self, weights: &mut [f64], scores: &[f64], leg: &[usize], total: f64, short: bool) {
        let equal = || {
            let each = total / leg.len() as f64;
            leg.iter().map(|_| each).collect::<Vec<f64>>()
        };
        let sized = match self.portfolio.weight {
            LegWeighting::Equal => equal(),
            LegWeighting::ScoreWeighted => {
                let (low, high) = leg.iter().map(|j| scores[*j]).fold(
                    (f64::INFINITY, f64::NEG_INFINITY),
                    |(lo, hi), s| (lo.min(s), hi.max(s)),
                );
                let range = high - low + SCORE_RANGE_FLOOR;
                // shorts lean hardest on the lowest scores
                let normalized: Vec<f64> = leg
                    .iter()
                    .map(|j| {
                        if short {
                            (high - scores[*j]) / range
                        } else {
                            (scores[*j] - low) / range
                        }
                    })
                    .collect();
                let sum: f64 = normalized.iter().sum();
                if sum <= 0.0 {
                    equal()
                } else {
                    normalized.iter().map(|w| total * w / sum).collect()
                }
            }
        };
        for (j, w) in leg.iter().zip(sized) {
            weights[*j] = w;
        }
    }

    fn apply_limits(&self, mut weights: Vec<f64>) -> Vec<f64> {
        if let Some(cap) = self.config.max_single_position {
            for w in weights.iter_mut() {
                *w = w.clamp(-cap, cap);
            }
        }
        let gross: f64 = weights.iter().map(|w| w.abs()).sum();
        let limit = self.config.max_gross_leverage;
        if gross > limit && gross > 0.0 {
            let scale = limit / gross;
            for w in weights.iter_mut() {
                *w *= scale;
            }
        }
        weights
    }

    /// Trades the composite signal through one test window. Weights decided
    /// at `t` earn the returns of `t + 1`.
    pub fn run_split(
        &self,
        split: &Split,
        signal: &Panel,
        prices: &Panel,
        returns: &Panel,
    ) -> EngineResult<SplitBacktest> {
        let failure = |reason: &str| EngineError::SplitComputation {
            index: split.index,
            reason: reason.to_string(),
        };
        if split.test.is_empty() {
            return Err(failure("test window is empty"));
        }

        let dates = signal.dates();
        let n_dates = signal.n_dates().min(returns.n_dates());
        if prices.n_dates() < n_dates {
            return Err(failure("price panel is shorter than the signal"));
        }
        let costs = &self.portfolio.costs;
        let trade_rate = costs.bps_per_trade / 10_000.0;
        let borrow_rate = costs.borrow_bps / 10_000.0 / self.periods_per_year;

        let mut weights = vec![0.0; signal.n_instruments()];
        let mut previous: Option<NaiveDate> = None;
        let mut records = Vec::with_capacity(split.test.len());
        let mut rebalances = 0;
        let mut rankable = 0;
        let mut missing_return_days = 0;

        for t in split.test.clone() {
            let date = dates[t];
            let mut turnover = 0.0;
            if starts_period(self.portfolio.rebalance, previous, date) {
                rebalances += 1;
                let outcome = self.target_weights(signal.row(t), prices.row(t));
                if outcome.is_rankable() {
                    rankable += 1;
                }
                let target = match outcome {
                    RebalanceOutcome::Book(target) => target,
                    _ => vec![0.0; weights.len()],
                };
                turnover = weights
                    .iter()
                    .zip(target.iter())
                    .map(|(old, new)| (new - old).abs())
                    .sum();
                weights = target;
            }
            previous = Some(date);

            if t + 1 >= n_dates {
                continue;
            }
            let next = returns.row(t + 1);
            let mut gross = 0.0;
            let mut short_exposure = 0.0;
            let mut missing = false;
            for (w, r) in weights.iter().zip(next.iter()) {
                if *w == 0.0 {
                    continue;
                }
                if *w < 0.0 {
                    short_exposure -= w;
                }
                if r.is_finite() {
                    gross += w * r;
                } else {
                    missing = true;
                }
            }
            if missing {
                missing_return_days += 1;
            }
            let cost = turnover * trade_rate + short_exposure * borrow_rate;
            records.push(PortfolioReturn {
                date: returns.dates()[t + 1],
                gross,
                cost,
                net: gross - cost,
                turnover,
            });
        }

        if rankable == 0 {
            return Err(failure(
                "no rebalance date in the test window had two rankable instruments",
            ));
        }
        if records.is_empty() {
            return Err(failure("test window has no forward returns"));
        }
        Ok(SplitBacktest {
            returns: records,
            rebalances,
            missing_return_days,
        })
    }
}
