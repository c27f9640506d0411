use crate::config::EngineConfig;
use crate::models::{MetricsBundle, RegimeStats};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Bull,
    Bear,
    HighVol,
    LowVol,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bull => "bull",
            Self::Bear => "bear",
            Self::HighVol => "high_vol",
            Self::LowVol => "low_vol",
        }
    }
}

/// Non-fatal findings attached to a backtest report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    LeakageSuspected {
        signal_id: String,
        correlation: f64,
        threshold: f64,
    },
    SplitFailed {
        index: usize,
        reason: String,
    },
    ReducedSplits {
        requested: usize,
        built: usize,
        min_test_days: usize,
    },
    EmbargoExtended {
        purge_gap_days: usize,
        embargo_days: usize,
    },
    RegimeShortfall {
        regime: Regime,
        sharpe: f64,
        min_sharpe: f64,
    },
    InsufficientRegimeSample {
        regime: Regime,
        days: usize,
        min_days: usize,
    },
    AlphaDecay {
        ic_decay_rate: f64,
        threshold: f64,
    },
    UnstableSharpe {
        drawdown: f64,
        max_drawdown: f64,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeakageSuspected {
                signal_id,
                correlation,
                threshold,
            } => write!(
                f,
                "signal {} has mean same-day correlation {:.3} with returns (threshold {:.3})",
                signal_id, correlation, threshold
            ),
            Self::SplitFailed { index, reason } => write!(f, "split {} failed: {}", index, reason),
            Self::ReducedSplits {
                requested,
                built,
                min_test_days,
            } => write!(
                f,
                "built {} of {} requested splits (each test window needs {} days)",
                built, requested, min_test_days
            ),
            Self::EmbargoExtended {
                purge_gap_days,
                embargo_days,
            } => write!(
                f,
                "embargo extended from {} to {} days to cover signal lookback",
                purge_gap_days, embargo_days
            ),
            Self::RegimeShortfall {
                regime,
                sharpe,
                min_sharpe,
            } => write!(
                f,
                "{} regime Sharpe {:.2} is below {:.2}",
                regime.as_str(),
                sharpe,
                min_sharpe
            ),
            Self::InsufficientRegimeSample {
                regime,
                days,
                min_days,
            } => write!(
                f,
                "{} regime has {} days, fewer than {}",
                regime.as_str(),
                days,
                min_days
            ),
            Self::AlphaDecay {
                ic_decay_rate,
                threshold,
            } => write!(
                f,
                "IC decayed by {:.1}% between halves (threshold {:.1}%)",
                ic_decay_rate * 100.0,
                threshold * 100.0
            ),
            Self::UnstableSharpe {
                drawdown,
                max_drawdown,
            } => write!(
                f,
                "rolling Sharpe fell {:.1}% from its peak (limit {:.1}%)",
                drawdown * 100.0,
                max_drawdown * 100.0
            ),
        }
    }
}

impl Diagnostic {
    pub fn log(&self) {
        warn!("{}", self);
    }
}

/// Regime, decay and stability findings for a scored backtest.
pub fn assess_metrics(metrics: &MetricsBundle, config: &EngineConfig) -> Vec<Diagnostic> {
    let mut findings = Vec::new();
    if metrics.core.days == 0 {
        return findings;
    }

    let regimes = &metrics.regimes;
    let by_regime: [(Regime, &RegimeStats); 4] = [
        (Regime::Bull, &regimes.bull),
        (Regime::Bear, &regimes.bear),
        (Regime::HighVol, &regimes.high_vol),
        (Regime::LowVol, &regimes.low_vol),
    ];
    for (regime, stats) in by_regime {
        if stats.days < config.min_regime_days {
            findings.push(Diagnostic::InsufficientRegimeSample {
                regime,
                days: stats.days,
                min_days: config.min_regime_days,
            });
        } else if stats.sharpe < config.min_regime_sharpe {
            findings.push(Diagnostic::RegimeShortfall {
                regime,
                sharpe: stats.sharpe,
                min_sharpe: config.min_regime_sharpe,
            });
        }
    }

    if metrics.decay.ic_decay_rate > config.decay_alert_threshold {
        findings.push(Diagnostic::AlphaDecay {
            ic_decay_rate: metrics.decay.ic_decay_rate,
            threshold: config.decay_alert_threshold,
        });
    }

    if metrics.stability.rolling_sharpe_drawdown > config.max_sharpe_drawdown {
        findings.push(Diagnostic::UnstableSharpe {
            drawdown: metrics.stability.rolling_sharpe_drawdown,
            max_drawdown: config.max_sharpe_drawdown,
        });
    }
    findings
}
