use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{Duration, NaiveDateTime};

use crate::error::{CapTestError, Result};

// ---------------------------------------------------------------------------
// TimeSeriesFrame – timestamp-indexed table of f64 columns
// ---------------------------------------------------------------------------

/// A timestamp-indexed table of numeric columns.
///
/// Values are stored column-major. Missing values are `NaN`; every column has
/// exactly `index.len()` entries.
#[derive(Debug, Clone, Default)]
pub struct TimeSeriesFrame {
    index: Vec<NaiveDateTime>,
    columns: Vec<String>,
    values: Vec<Vec<f64>>,
}

impl TimeSeriesFrame {
    /// An empty frame over the given index.
    pub fn new(index: Vec<NaiveDateTime>) -> Self {
        TimeSeriesFrame {
            index,
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Build a frame from `(name, values)` pairs, preserving their order.
    pub fn from_columns(
        index: Vec<NaiveDateTime>,
        columns: Vec<(String, Vec<f64>)>,
    ) -> Result<Self> {
        let mut frame = TimeSeriesFrame::new(index);
        for (name, values) in columns {
            if frame.has_column(&name) {
                return Err(CapTestError::InvalidArgument(format!(
                    "duplicate column name: {name}"
                )));
            }
            frame.insert_column(&name, values)?;
        }
        Ok(frame)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the frame has no rows.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[NaiveDateTime] {
        &self.index
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.position(name).map(|i| self.values[i].as_slice())
    }

    /// Like [`column`](Self::column) but a missing column is an error.
    pub fn try_column(&self, name: &str) -> Result<&[f64]> {
        self.column(name)
            .ok_or_else(|| CapTestError::ColumnNotFound(name.to_string()))
    }

    /// Insert a column, replacing any existing column of the same name.
    pub fn insert_column(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        if values.len() != self.len() {
            return Err(CapTestError::LengthMismatch {
                expected: self.len(),
                found: values.len(),
            });
        }
        match self.position(name) {
            Some(i) => self.values[i] = values,
            None => {
                self.columns.push(name.to_string());
                self.values.push(values);
            }
        }
        Ok(())
    }

    /// Remove a column. Returns whether it existed.
    pub fn drop_column(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(i) => {
                self.columns.remove(i);
                self.values.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn rename_column(&mut self, old: &str, new: &str) -> bool {
        if self.has_column(new) {
            return false;
        }
        match self.position(old) {
            Some(i) => {
                self.columns[i] = new.to_string();
                true
            }
            None => false,
        }
    }

    /// Transform every value of a column in place.
    pub fn map_column(&mut self, name: &str, f: impl Fn(f64) -> f64) -> Result<()> {
        let i = self
            .position(name)
            .ok_or_else(|| CapTestError::ColumnNotFound(name.to_string()))?;
        for v in &mut self.values[i] {
            *v = f(*v);
        }
        Ok(())
    }

    /// A new frame holding the given rows, in the given order.
    pub fn take_rows(&self, rows: &[usize]) -> Self {
        TimeSeriesFrame {
            index: rows.iter().map(|&r| self.index[r]).collect(),
            columns: self.columns.clone(),
            values: self
                .values
                .iter()
                .map(|col| rows.iter().map(|&r| col[r]).collect())
                .collect(),
        }
    }

    /// A new frame holding only the named columns.
    pub fn select(&self, names: &[&str]) -> Result<Self> {
        let mut out = TimeSeriesFrame::new(self.index.clone());
        for name in names {
            out.insert_column(name, self.try_column(name)?.to_vec())?;
        }
        Ok(out)
    }

    pub fn row(&self, position: usize) -> Row<'_> {
        Row {
            frame: self,
            position,
        }
    }

    /// Stable sort of all rows by timestamp.
    pub fn sort_by_index(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by_key(|&r| self.index[r]);
        if order.iter().enumerate().all(|(i, &r)| i == r) {
            return;
        }
        *self = self.take_rows(&order);
    }

    /// Drop rows whose timestamp already appeared, keeping the first.
    /// Returns the number of rows removed.
    pub fn drop_duplicate_index(&mut self) -> usize {
        let mut seen = HashSet::with_capacity(self.len());
        let keep: Vec<usize> = (0..self.len())
            .filter(|&r| seen.insert(self.index[r]))
            .collect();
        let removed = self.len() - keep.len();
        if removed > 0 {
            *self = self.take_rows(&keep);
        }
        removed
    }

    /// Drop columns and rows that contain only `NaN`.
    pub fn drop_empty(&mut self) {
        let mut c = 0;
        while c < self.columns.len() {
            if self.values[c].iter().all(|v| v.is_nan()) {
                self.columns.remove(c);
                self.values.remove(c);
            } else {
                c += 1;
            }
        }
        let keep: Vec<usize> = (0..self.len())
            .filter(|&r| self.values.iter().any(|col| !col[r].is_nan()))
            .collect();
        if keep.len() != self.len() {
            *self = self.take_rows(&keep);
        }
    }

    /// The most common positive step between consecutive timestamps.
    /// Ties resolve to the shorter step.
    pub fn frequency(&self) -> Option<Duration> {
        let mut counts: BTreeMap<Duration, usize> = BTreeMap::new();
        for pair in self.index.windows(2) {
            let step = pair[1] - pair[0];
            if step > Duration::zero() {
                *counts.entry(step).or_default() += 1;
            }
        }
        let max = counts.values().copied().max()?;
        counts
            .into_iter()
            .find(|(_, n)| *n == max)
            .map(|(step, _)| step)
    }

    /// Place the rows onto a regular grid from the first to the last
    /// timestamp. Grid points without data become `NaN` rows; rows that fall
    /// between grid points are dropped.
    pub fn reindex(&self, freq: Duration) -> Result<Self> {
        if freq <= Duration::zero() {
            return Err(CapTestError::InvalidArgument(format!(
                "reindex frequency must be positive, got {freq}"
            )));
        }
        let (Some(&start), Some(&end)) = (self.index.iter().min(), self.index.iter().max())
        else {
            return Ok(self.clone());
        };

        let mut lookup: HashMap<NaiveDateTime, usize> = HashMap::with_capacity(self.len());
        for (r, ts) in self.index.iter().enumerate() {
            lookup.entry(*ts).or_insert(r);
        }

        let mut grid = Vec::new();
        let mut ts = start;
        while ts <= end {
            grid.push(ts);
            ts += freq;
        }

        let sources: Vec<Option<usize>> = grid.iter().map(|t| lookup.get(t).copied()).collect();
        let placed = sources.iter().flatten().count();
        if placed < self.len() {
            log::debug!(
                "reindex dropped {} rows off the {freq} grid",
                self.len() - placed
            );
        }

        Ok(TimeSeriesFrame {
            index: grid,
            columns: self.columns.clone(),
            values: self
                .values
                .iter()
                .map(|col| {
                    sources
                        .iter()
                        .map(|src| src.map_or(f64::NAN, |r| col[r]))
                        .collect()
                })
                .collect(),
        })
    }

    /// Stack frames row-wise. Columns are the union in first-seen order; a
    /// frame lacking a column contributes `NaN`. Rows are sorted by time.
    pub fn concat(frames: &[TimeSeriesFrame]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for frame in frames {
            for col in &frame.columns {
                if !columns.contains(col) {
                    columns.push(col.clone());
                }
            }
        }

        let mut out = TimeSeriesFrame {
            index: Vec::new(),
            values: vec![Vec::new(); columns.len()],
            columns,
        };
        for frame in frames {
            out.index.extend_from_slice(&frame.index);
            for (c, name) in out.columns.iter().enumerate() {
                match frame.column(name) {
                    Some(vals) => out.values[c].extend_from_slice(vals),
                    None => out.values[c].extend(std::iter::repeat(f64::NAN).take(frame.len())),
                }
            }
        }
        out.sort_by_index();
        out
    }
}

impl fmt::Display for TimeSeriesFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX_ROWS: usize = 10;
        write!(f, "{:<20}", "timestamp")?;
        for col in &self.columns {
            write!(f, " {col:>14}")?;
        }
        writeln!(f)?;
        for r in 0..self.len().min(MAX_ROWS) {
            write!(f, "{:<20}", self.index[r].format("%Y-%m-%d %H:%M"))?;
            for col in &self.values {
                write!(f, " {:>14.3}", col[r])?;
            }
            writeln!(f)?;
        }
        if self.len() > MAX_ROWS {
            writeln!(f, "... {} rows x {} columns", self.len(), self.columns.len())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row – borrowed view of one row
// ---------------------------------------------------------------------------

/// A borrowed view of a single row, handed to custom filter predicates.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    frame: &'a TimeSeriesFrame,
    position: usize,
}

impl<'a> Row<'a> {
    pub fn timestamp(&self) -> NaiveDateTime {
        self.frame.index[self.position]
    }

    /// Value of a column in this row, `None` if the column does not exist.
    pub fn get(&self, column: &str) -> Option<f64> {
        self.frame.column(column).map(|vals| vals[self.position])
    }

    /// Row position in the frame it was taken from.
    pub fn position(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(day: u32, hour: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 8, day)
            .unwrap()
            .and_hms_opt(hour, min, 0)
            .unwrap()
    }

    fn hourly(day: u32, n: u32) -> Vec<NaiveDateTime> {
        (0..n).map(|h| ts(day, h, 0)).collect()
    }

    #[test]
    fn insert_rejects_wrong_length() {
        let mut frame = TimeSeriesFrame::new(hourly(1, 3));
        let err = frame.insert_column("a", vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, CapTestError::LengthMismatch { expected: 3, found: 2 }));
    }

    #[test]
    fn frequency_is_most_common_step() {
        let index = vec![ts(1, 0, 0), ts(1, 0, 5), ts(1, 0, 10), ts(1, 1, 0), ts(1, 1, 5)];
        let frame = TimeSeriesFrame::new(index);
        assert_eq!(frame.frequency(), Some(Duration::minutes(5)));
        assert_eq!(TimeSeriesFrame::new(vec![ts(1, 0, 0)]).frequency(), None);
    }

    #[test]
    fn reindex_fills_gaps_with_nan() {
        let frame = TimeSeriesFrame::from_columns(
            vec![ts(1, 0, 0), ts(1, 3, 0)],
            vec![("a".into(), vec![1.0, 4.0])],
        )
        .unwrap();
        let full = frame.reindex(Duration::hours(1)).unwrap();
        assert_eq!(full.len(), 4);
        let a = full.column("a").unwrap();
        assert_eq!(a[0], 1.0);
        assert!(a[1].is_nan() && a[2].is_nan());
        assert_eq!(a[3], 4.0);
    }

    #[test]
    fn concat_unions_columns_and_sorts() {
        let day2 = TimeSeriesFrame::from_columns(
            hourly(2, 24),
            vec![("b".into(), vec![1.0; 24]), ("c".into(), vec![2.0; 24])],
        )
        .unwrap();
        let day1 = TimeSeriesFrame::from_columns(
            hourly(1, 24),
            vec![("a".into(), vec![0.0; 24]), ("b".into(), vec![3.0; 24])],
        )
        .unwrap();
        let joined = TimeSeriesFrame::concat(&[day2, day1]);
        assert_eq!(joined.len(), 48);
        assert_eq!(joined.columns(), &["b", "c", "a"]);
        assert!(joined.index().windows(2).all(|w| w[0] <= w[1]));
        assert!(joined.column("c").unwrap()[..24].iter().all(|v| v.is_nan()));
        assert!(joined.column("a").unwrap()[24..].iter().all(|v| v.is_nan()));
        assert_eq!(joined.column("b").unwrap()[0], 3.0);
    }

    #[test]
    fn duplicate_timestamps_keep_first() {
        let mut frame = TimeSeriesFrame::from_columns(
            vec![ts(1, 0, 0), ts(1, 0, 0), ts(1, 1, 0)],
            vec![("a".into(), vec![1.0, 2.0, 3.0])],
        )
        .unwrap();
        assert_eq!(frame.drop_duplicate_index(), 1);
        assert_eq!(frame.column("a").unwrap(), &[1.0, 3.0]);
    }

    #[test]
    fn drop_empty_removes_all_nan_rows_and_columns() {
        let mut frame = TimeSeriesFrame::from_columns(
            hourly(1, 3),
            vec![
                ("a".into(), vec![1.0, f64::NAN, 3.0]),
                ("b".into(), vec![f64::NAN; 3]),
            ],
        )
        .unwrap();
        frame.drop_empty();
        assert_eq!(frame.columns(), &["a"]);
        assert_eq!(frame.len(), 2);
    }
}
