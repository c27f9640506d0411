use crate::diagnostics::Diagnostic;
use crate::error::{EngineError, EngineResult};
use crate::models::SplitWindow;
use chrono::NaiveDate;
use std::ops::Range;

/// Inputs that shape the walk-forward plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSettings {
    pub n_splits: usize,
    pub min_history_days: usize,
    pub embargo_days: usize,
    pub min_test_days: usize,
}

/// One train/embargo/test partition, as date indices into the panels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub index: usize,
    pub train: Range<usize>,
    pub embargo: Range<usize>,
    pub test: Range<usize>,
}

impl Split {
    pub fn window(&self, dates: &[NaiveDate]) -> SplitWindow {
        let first = |range: &Range<usize>| dates[range.start.min(dates.len() - 1)];
        let last = |range: &Range<usize>| dates[range.end.saturating_sub(1).min(dates.len() - 1)];
        SplitWindow {
            index: self.index,
            train: self.train.clone(),
            embargo: self.embargo.clone(),
            test: self.test.clone(),
            train_start: first(&self.train),
            train_end: last(&self.train),
            test_start: first(&self.test),
            test_end: last(&self.test),
        }
    }
}

/// Effective embargo: the purge gap, stretched to the factor's lookback when
/// requested.
pub fn effective_embargo(purge_gap_days: usize, max_lookback: usize, extend: bool) -> usize {
    if extend {
        purge_gap_days.max(max_lookback)
    } else {
        purge_gap_days
    }
}

/// Walk-forward splits over `[min_history_days, n_dates)`, yielded in
/// chronological order. Each split trains on everything before its test
/// window minus the embargo.
#[derive(Debug)]
pub struct PurgedWalkForward {
    region_start: usize,
    base_len: usize,
    remainder: usize,
    built: usize,
    requested: usize,
    embargo: usize,
    min_test_days: usize,
    next: usize,
}

impl PurgedWalkForward {
    pub fn new(n_dates: usize, settings: SplitSettings) -> EngineResult<Self> {
        let SplitSettings {
            n_splits,
            min_history_days,
            embargo_days,
            min_test_days,
        } = settings;
        if n_splits == 0 {
            return Err(EngineError::configuration("n_splits must be >= 1"));
        }
        if n_dates < min_history_days {
            return Err(EngineError::configuration(format!(
                "panel holds {} dates, fewer than min_history_days ({})",
                n_dates, min_history_days
            )));
        }
        let region = n_dates - min_history_days;
        if region == 0 {
            return Err(EngineError::configuration(format!(
                "no dates remain for testing after min_history_days ({})",
                min_history_days
            )));
        }
        if embargo_days >= min_history_days {
            return Err(EngineError::configuration(format!(
                "embargo of {} days leaves no training history before the first test window (min_history_days {})",
                embargo_days, min_history_days
            )));
        }

        let built = n_splits.min(region / min_test_days.max(1)).max(1);
        Ok(Self {
            region_start: min_history_days,
            base_len: region / built,
            remainder: region % built,
            built,
            requested: n_splits,
            embargo: embargo_days,
            min_test_days,
            next: 0,
        })
    }

    /// Number of splits the plan yields.
    pub fn split_count(&self) -> usize {
        self.built
    }

    pub fn embargo_days(&self) -> usize {
        self.embargo
    }

    /// Set when the test region was too short for the requested split count.
    pub fn reduction(&self) -> Option<Diagnostic> {
        (self.built < self.requested).then(|| Diagnostic::ReducedSplits {
            requested: self.requested,
            built: self.built,
            min_test_days: self.min_test_days,
        })
    }

    fn test_range(&self, k: usize) -> Range<usize> {
        let start = self.region_start + k * self.base_len + k.min(self.remainder);
        let len = self.base_len + usize::from(k < self.remainder);
        start..start + len
    }
}

impl Iterator for PurgedWalkForward {
    type Item = Split;

    fn next(&mut self) -> Option<Split> {
        if self.next >= self.built {
            return None;
        }
        let index = self.next;
        self.next += 1;

        let test = self.test_range(index);
        let train_end = test.start - self.embargo;
        Some(Split {
            index,
            train: 0..train_end,
            embargo: train_end..test.start,
            test,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.built - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for PurgedWalkForward {}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(n_splits: usize, min_history_days: usize, embargo_days: usize) -> SplitSettings {
        SplitSettings {
            n_splits,
            min_history_days,
            embargo_days,
            min_test_days: 63,
        }
    }

    #[test]
    fn splits_respect_embargo_and_do_not_overlap() {
        let splits: Vec<Split> = PurgedWalkForward::new(2000, settings(5, 800, 21))
            .unwrap()
            .collect();
        assert_eq!(splits.len(), 5);

        for split in &splits {
            assert!(!split.train.is_empty());
            assert!(!split.test.is_empty());
            assert!(split.test.start - split.train.end >= 21);
            assert_eq!(split.embargo.end, split.test.start);
        }
        for pair in splits.windows(2) {
            assert_eq!(pair[0].test.end, pair[1].test.start);
        }
        assert_eq!(splits[0].test.start, 800);
        assert_eq!(splits[4].test.end, 2000);
    }

    #[test]
    fn remainder_goes_to_earliest_windows() {
        let plan = PurgedWalkForward::new(
            1003,
            SplitSettings {
                min_test_days: 40,
                ..settings(5, 800, 21)
            },
        )
        .unwrap();
        let splits: Vec<Split> = plan.collect();
        let lengths: Vec<usize> = splits.iter().map(|s| s.test.len()).collect();
        assert_eq!(lengths, vec![41, 41, 41, 40, 40]);
    }

    #[test]
    fn short_region_reduces_split_count() {
        let plan = PurgedWalkForward::new(1000, settings(5, 800, 21)).unwrap();
        assert_eq!(plan.split_count(), 3);
        assert_eq!(
            plan.reduction(),
            Some(Diagnostic::ReducedSplits {
                requested: 5,
                built: 3,
                min_test_days: 63,
            })
        );
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn insufficient_history_is_rejected() {
        let err = PurgedWalkForward::new(500, settings(5, 800, 21)).unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));

        let err = PurgedWalkForward::new(800, settings(5, 800, 21)).unwrap_err();
        assert!(err.to_string().contains("no dates remain"));
    }

    #[test]
    fn short_region_still_builds_one_split() {
        let plan = PurgedWalkForward::new(850, settings(5, 800, 21)).unwrap();
        assert_eq!(plan.split_count(), 1);
        assert!(plan.reduction().is_some());
        let splits: Vec<Split> = plan.collect();
        assert_eq!(splits[0].test, 800..850);
    }

    #[test]
    fn embargo_must_leave_training_data() {
        let err = PurgedWalkForward::new(2000, settings(5, 300, 300)).unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[test]
    fn embargo_extends_to_lookback() {
        assert_eq!(effective_embargo(21, 253, true), 253);
        assert_eq!(effective_embargo(21, 253, false), 21);
        assert_eq!(effective_embargo(21, 5, true), 21);
    }

    #[test]
    fn window_reports_dates() {
        let dates: Vec<NaiveDate> = (0..200)
            .map(|i| NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + chrono::Duration::days(i))
            .collect();
        let plan = PurgedWalkForward::new(
            200,
            SplitSettings {
                n_splits: 2,
                min_history_days: 100,
                embargo_days: 10,
                min_test_days: 20,
            },
        )
        .unwrap();
        let windows: Vec<SplitWindow> = plan.map(|split| split.window(&dates)).collect();
        assert_eq!(windows[1].test_start, dates[150]);
        assert_eq!(windows[1].test_end, dates[199]);
        assert_eq!(windows[1].train_end, dates[139]);
        assert_eq!(windows[0].train_start, dates[0]);
    }
}
