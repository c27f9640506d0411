use crate::error::{EngineError, EngineResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A (date x instrument) matrix of observations. `NaN` marks a missing value.
///
/// The date and instrument index is shared behind `Arc`, so transforms that
/// produce a new panel over the same index never copy it and never touch the
/// source values.
#[derive(Debug, Clone)]
pub struct Panel {
    dates: Arc<[NaiveDate]>,
    instruments: Arc<[String]>,
    values: Vec<f64>,
}

/// On-disk / wire shape of a panel: one row per date, `null` for missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelFrame {
    pub dates: Vec<NaiveDate>,
    pub instruments: Vec<String>,
    pub values: Vec<Vec<Option<f64>>>,
}

impl Panel {
    pub fn new(
        dates: Vec<NaiveDate>,
        instruments: Vec<String>,
        values: Vec<f64>,
    ) -> EngineResult<Self> {
        if values.len() != dates.len() * instruments.len() {
            return Err(EngineError::data(format!(
                "expected {} values for {} dates x {} instruments, got {}",
                dates.len() * instruments.len(),
                dates.len(),
                instruments.len(),
                values.len()
            )));
        }
        if let Some(pair) = dates.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(EngineError::data(format!(
                "dates must be strictly increasing ({} is followed by {})",
                pair[0], pair[1]
            )));
        }
        let mut seen = HashSet::with_capacity(instruments.len());
        for instrument in &instruments {
            if !seen.insert(instrument.as_str()) {
                return Err(EngineError::data(format!(
                    "duplicate instrument {}",
                    instrument
                )));
            }
        }

        let values = values
            .into_iter()
            .map(|value| if value.is_finite() { value } else { f64::NAN })
            .collect();

        Ok(Self {
            dates: Arc::from(dates),
            instruments: Arc::from(instruments),
            values,
        })
    }

    pub fn from_rows(
        dates: Vec<NaiveDate>,
        instruments: Vec<String>,
        rows: Vec<Vec<f64>>,
    ) -> EngineResult<Self> {
        if rows.len() != dates.len() {
            return Err(EngineError::data(format!(
                "expected {} rows, got {}",
                dates.len(),
                rows.len()
            )));
        }
        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != instruments.len())
        {
            return Err(EngineError::data(format!(
                "row {} has {} values, expected {}",
                index,
                row.len(),
                instruments.len()
            )));
        }
        let values = rows.into_iter().flatten().collect();
        Self::new(dates, instruments, values)
    }

    pub fn from_frame(frame: PanelFrame) -> EngineResult<Self> {
        let PanelFrame {
            dates,
            instruments,
            values,
        } = frame;
        let rows = values
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|value| value.unwrap_or(f64::NAN))
                    .collect()
            })
            .collect();
        Self::from_rows(dates, instruments, rows)
    }

    pub fn to_frame(&self) -> PanelFrame {
        PanelFrame {
            dates: self.dates.to_vec(),
            instruments: self.instruments.to_vec(),
            values: (0..self.n_dates())
                .map(|t| self.row(t).iter().map(|v| finite(*v)).collect())
                .collect(),
        }
    }

    /// A panel over the same index holding `value` everywhere.
    pub fn filled_like(&self, value: f64) -> Self {
        self.with_values(vec![value; self.values.len()])
    }

    fn with_values(&self, mut values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), self.values.len());
        for value in values.iter_mut().filter(|v| v.is_infinite()) {
            *value = f64::NAN;
        }
        Self {
            dates: Arc::clone(&self.dates),
            instruments: Arc::clone(&self.instruments),
            values,
        }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    pub fn n_dates(&self) -> usize {
        self.dates.len()
    }

    pub fn n_instruments(&self) -> usize {
        self.instruments.len()
    }

    pub fn value(&self, t: usize, j: usize) -> f64 {
        self.values[t * self.instruments.len() + j]
    }

    pub fn get(&self, t: usize, j: usize) -> Option<f64> {
        finite(self.value(t, j))
    }

    pub fn row(&self, t: usize) -> &[f64] {
        let width = self.instruments.len();
        &self.values[t * width..(t + 1) * width]
    }

    pub fn column(&self, j: usize) -> Vec<f64> {
        (0..self.n_dates()).map(|t| self.value(t, j)).collect()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn present_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_finite()).count()
    }

    pub fn same_index(&self, other: &Panel) -> bool {
        (Arc::ptr_eq(&self.dates, &other.dates) || self.dates == other.dates)
            && (Arc::ptr_eq(&self.instruments, &other.instruments)
                || self.instruments == other.instruments)
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Panel {
        self.with_values(self.values.iter().map(|v| f(*v)).collect())
    }

    /// Applies a per-instrument time-series transform.
    pub fn map_columns(&self, f: impl Fn(&[f64]) -> Vec<f64>) -> Panel {
        let width = self.n_instruments();
        let mut values = vec![f64::NAN; self.values.len()];
        for j in 0..width {
            let output = f(&self.column(j));
            for (t, value) in output.into_iter().enumerate().take(self.n_dates()) {
                values[t * width + j] = value;
            }
        }
        self.with_values(values)
    }

    pub fn try_map_columns(
        &self,
        f: impl Fn(&[f64]) -> EngineResult<Vec<f64>>,
    ) -> EngineResult<Panel> {
        let width = self.n_instruments();
        let mut values = vec![f64::NAN; self.values.len()];
        for j in 0..width {
            let output = f(&self.column(j))?;
            for (t, value) in output.into_iter().enumerate().take(self.n_dates()) {
                values[t * width + j] = value;
            }
        }
        Ok(self.with_values(values))
    }

    /// Applies a per-date cross-sectional transform.
    pub fn map_rows(&self, f: impl Fn(&[f64]) -> Vec<f64>) -> Panel {
        let width = self.n_instruments();
        let mut values = Vec::with_capacity(self.values.len());
        for t in 0..self.n_dates() {
            let mut output = f(self.row(t));
            output.resize(width, f64::NAN);
            values.extend(output);
        }
        self.with_values(values)
    }

    /// Pairwise per-instrument transform of two panels sharing an index.
    pub fn zip_columns(
        &self,
        other: &Panel,
        f: impl Fn(&[f64], &[f64]) -> Vec<f64>,
    ) -> EngineResult<Panel> {
        self.ensure_same_index(other)?;
        let width = self.n_instruments();
        let mut values = vec![f64::NAN; self.values.len()];
        for j in 0..width {
            let output = f(&self.column(j), &other.column(j));
            for (t, value) in output.into_iter().enumerate().take(self.n_dates()) {
                values[t * width + j] = value;
            }
        }
        Ok(self.with_values(values))
    }

    pub fn zip_with(&self, other: &Panel, f: impl Fn(f64, f64) -> f64) -> EngineResult<Panel> {
        self.ensure_same_index(other)?;
        Ok(self.with_values(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| f(*a, *b))
                .collect(),
        ))
    }

    fn ensure_same_index(&self, other: &Panel) -> EngineResult<()> {
        if self.same_index(other) {
            Ok(())
        } else {
            Err(EngineError::data(
                "panels must share the same date and instrument index",
            ))
        }
    }

    /// Restricts the panel to `dates` x `instruments`; entries absent from
    /// this panel come back missing.
    pub fn reindex(&self, dates: &[NaiveDate], instruments: &[String]) -> EngineResult<Panel> {
        let date_pos: HashMap<&NaiveDate, usize> =
            self.dates.iter().enumerate().map(|(i, d)| (d, i)).collect();
        let inst_pos: HashMap<&str, usize> = self
            .instruments
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut values = Vec::with_capacity(dates.len() * instruments.len());
        for date in dates {
            for instrument in instruments {
                let value = match (date_pos.get(date), inst_pos.get(instrument.as_str())) {
                    (Some(&t), Some(&j)) => self.value(t, j),
                    _ => f64::NAN,
                };
                values.push(value);
            }
        }
        Panel::new(dates.to_vec(), instruments.to_vec(), values)
    }

    /// Restricts two panels to their common dates and instruments, in the
    /// order of `first`.
    pub fn align(first: &Panel, second: &Panel) -> EngineResult<(Panel, Panel)> {
        if first.same_index(second) {
            return Ok((first.clone(), second.clone()));
        }
        let other_dates: HashSet<&NaiveDate> = second.dates.iter().collect();
        let other_instruments: HashSet<&str> =
            second.instruments.iter().map(String::as_str).collect();
        let dates: Vec<NaiveDate> = first
            .dates
            .iter()
            .filter(|d| other_dates.contains(d))
            .copied()
            .collect();
        let instruments: Vec<String> = first
            .instruments
            .iter()
            .filter(|name| other_instruments.contains(name.as_str()))
            .cloned()
            .collect();
        if dates.is_empty() || instruments.is_empty() {
            return Err(EngineError::configuration(
                "price and return panels have no dates or instruments in common",
            ));
        }

        let aligned_first = first.reindex(&dates, &instruments)?;
        let aligned_second = second.reindex(&dates, &instruments)?;
        // Share one index allocation between the two outputs.
        let aligned_second = aligned_first.with_values(aligned_second.values);
        Ok((aligned_first, aligned_second))
    }

    /// Simple daily returns; the first date and any date whose previous price
    /// is missing or non-positive are missing.
    pub fn returns_from_prices(prices: &Panel) -> Panel {
        prices.map_columns(|column| {
            let mut out = vec![f64::NAN; column.len()];
            for t in 1..column.len() {
                let (prev, curr) = (column[t - 1], column[t]);
                if prev.is_finite() && curr.is_finite() && prev > 0.0 {
                    out[t] = curr / prev - 1.0;
                }
            }
            out
        })
    }

    /// Bitwise equality of index and values, treating matching `NaN`s as equal.
    pub fn identical(&self, other: &Panel) -> bool {
        self.same_index(other)
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

pub fn finite(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Price and return panels over one shared index.
#[derive(Debug, Clone)]
pub struct MarketPanels {
    prices: Panel,
    returns: Panel,
}

impl MarketPanels {
    /// Aligns supplied returns to the prices, or derives simple returns when
    /// none are given.
    pub fn new(prices: Panel, returns: Option<Panel>) -> EngineResult<Self> {
        let (prices, returns) = match returns {
            Some(returns) => Panel::align(&prices, &returns)?,
            None => {
                let returns = Panel::returns_from_prices(&prices);
                (prices, returns)
            }
        };
        if prices.n_dates() == 0 || prices.n_instruments() == 0 {
            return Err(EngineError::configuration("market panels are empty"));
        }
        Ok(Self { prices, returns })
    }

    pub fn prices(&self) -> &Panel {
        &self.prices
    }

    pub fn returns(&self) -> &Panel {
        &self.returns
    }

    pub fn dates(&self) -> &[NaiveDate] {
        self.prices.dates()
    }

    pub fn n_dates(&self) -> usize {
        self.prices.n_dates()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rejects_non_increasing_dates() {
        let err = Panel::new(vec![day(2), day(2)], names(&["A"]), vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, EngineError::Data { .. }));
    }

    #[test]
    fn rejects_duplicate_instruments() {
        let err = Panel::new(vec![day(2)], names(&["A", "A"]), vec![1.0, 2.0]).unwrap_err();
        assert!(err.to_string().contains("duplicate instrument A"));
    }

    #[test]
    fn infinite_values_become_missing() {
        let panel = Panel::new(vec![day(2)], names(&["A", "B"]), vec![f64::INFINITY, 1.0]).unwrap();
        assert_eq!(panel.get(0, 0), None);
        assert_eq!(panel.get(0, 1), Some(1.0));
    }

    #[test]
    fn derived_returns_leave_gaps_missing() {
        let prices = Panel::from_rows(
            vec![day(2), day(3), day(4)],
            names(&["A"]),
            vec![vec![100.0], vec![f64::NAN], vec![110.0]],
        )
        .unwrap();
        let returns = Panel::returns_from_prices(&prices);
        assert_eq!(returns.get(0, 0), None);
        assert_eq!(returns.get(1, 0), None);
        assert_eq!(returns.get(2, 0), None);
    }

    #[test]
    fn align_keeps_common_domain_in_first_order() {
        let prices = Panel::from_rows(
            vec![day(2), day(3), day(4)],
            names(&["A", "B", "C"]),
            vec![vec![1.0, 2.0, 3.0]; 3],
        )
        .unwrap();
        let returns = Panel::from_rows(
            vec![day(3), day(4), day(5)],
            names(&["C", "A"]),
            vec![vec![0.3, 0.1]; 3],
        )
        .unwrap();
        let (p, r) = Panel::align(&prices, &returns).unwrap();
        assert_eq!(p.dates(), &[day(3), day(4)]);
        assert_eq!(p.instruments(), names(&["A", "C"]).as_slice());
        assert!(p.same_index(&r));
        assert_eq!(r.get(0, 0), Some(0.1));
        assert_eq!(r.get(0, 1), Some(0.3));
    }

    #[test]
    fn transforms_do_not_mutate_the_source() {
        let panel = Panel::from_rows(vec![day(2)], names(&["A", "B"]), vec![vec![1.0, 2.0]]).unwrap();
        let doubled = panel.map(|v| v * 2.0);
        assert_eq!(panel.get(0, 1), Some(2.0));
        assert_eq!(doubled.get(0, 1), Some(4.0));
        assert!(doubled.same_index(&panel));
    }

    #[test]
    fn frame_round_trip_preserves_missing() {
        let panel = Panel::from_rows(
            vec![day(2), day(3)],
            names(&["A", "B"]),
            vec![vec![1.0, f64::NAN], vec![2.0, 3.0]],
        )
        .unwrap();
        let frame = panel.to_frame();
        assert_eq!(frame.values[0][1], None);
        let back = Panel::from_frame(frame).unwrap();
        assert!(back.identical(&panel));
    }
}
