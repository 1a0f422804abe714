use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::model::{Row, TimeSeriesFrame};
use crate::error::{CapTestError, Result};

// ---------------------------------------------------------------------------
// Row-selection predicates
// ---------------------------------------------------------------------------
//
// Each function takes the frame and the row positions that currently pass
// and returns the subset that still passes. Order is preserved. `NaN`
// values never pass a numeric band.

fn retain(rows: &[usize], mut keep: impl FnMut(usize) -> bool) -> Vec<usize> {
    rows.iter().copied().filter(|&r| keep(r)).collect()
}

/// Keep rows with `low <= values <= high`.
pub fn band(values: &[f64], rows: &[usize], low: f64, high: f64) -> Vec<usize> {
    retain(rows, |r| values[r] >= low && values[r] <= high)
}

/// Irradiance band. With `ref_val` the bounds are fractions of it.
pub fn irradiance(
    poa: &[f64],
    rows: &[usize],
    low: f64,
    high: f64,
    ref_val: Option<f64>,
) -> Vec<usize> {
    let scale = ref_val.unwrap_or(1.0);
    band(poa, rows, low * scale, high * scale)
}

/// Percent difference of two readings relative to their mean.
pub fn perc_difference(a: f64, b: f64) -> f64 {
    if a == b {
        return 0.0;
    }
    ((a - b) / ((a + b) / 2.0)).abs()
}

/// Keep rows where every pair of sensors agrees within `perc_diff`.
pub fn sensors_agree(columns: &[&[f64]], rows: &[usize], perc_diff: f64) -> Vec<usize> {
    retain(rows, |r| {
        for (i, a) in columns.iter().enumerate() {
            for b in &columns[i + 1..] {
                let diff = perc_difference(a[r], b[r]);
                if diff.is_nan() || diff > perc_diff {
                    return false;
                }
            }
        }
        true
    })
}

/// Keep rows the predicate accepts.
pub fn custom<F>(frame: &TimeSeriesFrame, rows: &[usize], mut predicate: F) -> Vec<usize>
where
    F: FnMut(&Row<'_>) -> bool,
{
    retain(rows, |r| predicate(&frame.row(r)))
}

/// Drop the `contamination` fraction of rows lying farthest, by Mahalanobis
/// distance, from the centre of the `(x, y)` cloud. Rows with `NaN` in
/// either variable are dropped.
pub fn outliers(x: &[f64], y: &[f64], rows: &[usize], contamination: f64) -> Vec<usize> {
    let valid = retain(rows, |r| !x[r].is_nan() && !y[r].is_nan());
    let n = valid.len();
    if n < 3 {
        return valid;
    }
    let nf = n as f64;
    let mx = valid.iter().map(|&r| x[r]).sum::<f64>() / nf;
    let my = valid.iter().map(|&r| y[r]).sum::<f64>() / nf;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for &r in &valid {
        let (dx, dy) = (x[r] - mx, y[r] - my);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    sxx /= nf - 1.0;
    syy /= nf - 1.0;
    sxy /= nf - 1.0;
    let det = sxx * syy - sxy * sxy;
    if det.abs() < f64::EPSILON {
        log::warn!("outlier filter skipped: (x, y) covariance is singular");
        return valid;
    }

    let distance = |r: usize| {
        let (dx, dy) = (x[r] - mx, y[r] - my);
        (syy * dx * dx - 2.0 * sxy * dx * dy + sxx * dy * dy) / det
    };

    let n_drop = (contamination.clamp(0.0, 1.0) * nf).round() as usize;
    if n_drop == 0 {
        return valid;
    }
    let mut ranked: Vec<(f64, usize)> = valid.iter().map(|&r| (distance(r), r)).collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    let mut dropped: Vec<usize> = ranked.iter().take(n_drop).map(|&(_, r)| r).collect();
    dropped.sort_unstable();
    retain(&valid, |r| dropped.binary_search(&r).is_err())
}

/// Keep rows inside the inclusive `[start, end]` window, or outside it when
/// `drop` is set.
pub fn time_window(
    index: &[NaiveDateTime],
    rows: &[usize],
    start: NaiveDateTime,
    end: NaiveDateTime,
    drop: bool,
) -> Vec<usize> {
    retain(rows, |r| {
        let inside = index[r] >= start && index[r] <= end;
        inside != drop
    })
}

/// A time window given by any of: start and end, start plus a number of
/// days, end minus a number of days, or `days` centred on a test date.
/// A lone start or end runs to the last or from the first timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeWindow {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub days: Option<u32>,
    pub test_date: Option<NaiveDateTime>,
    /// Drop the window instead of keeping it.
    pub drop: bool,
}

impl TimeWindow {
    pub fn between(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        TimeWindow {
            start: Some(start),
            end: Some(end),
            ..Default::default()
        }
    }

    /// Inclusive `(start, end)` bounds against the given index.
    pub fn resolve(&self, index: &[NaiveDateTime]) -> Result<(NaiveDateTime, NaiveDateTime)> {
        let span = self
            .days
            .map(|d| Duration::try_days(i64::from(d)).ok_or_else(|| out_of_range(d)))
            .transpose()?;
        let shift = |t: NaiveDateTime, by: Duration| {
            t.checked_add_signed(by)
                .ok_or_else(|| out_of_range(self.days.unwrap_or_default()))
        };
        let (start, end) = match (self.test_date, self.start, self.end, span) {
            (Some(date), _, _, Some(span)) => (shift(date, -(span / 2))?, shift(date, span / 2)?),
            (Some(_), _, _, None) => {
                return Err(CapTestError::InvalidArgument(
                    "a test date needs a number of days".to_string(),
                ))
            }
            (None, Some(start), Some(end), _) => (start, end),
            (None, Some(start), None, Some(span)) => (start, shift(start, span)?),
            (None, None, Some(end), Some(span)) => (shift(end, -span)?, end),
            (None, Some(start), None, None) => match index.iter().max() {
                Some(&last) => (start, last),
                None => (start, start),
            },
            (None, None, Some(end), None) => match index.iter().min() {
                Some(&first) => (first, end),
                None => (end, end),
            },
            (None, None, None, _) => {
                return Err(CapTestError::InvalidArgument(
                    "time window needs a start, an end or a test date".to_string(),
                ))
            }
        };
        if start > end {
            return Err(CapTestError::InvalidArgument(format!(
                "time window starts ({start}) after it ends ({end})"
            )));
        }
        Ok((start, end))
    }
}

fn out_of_range(days: u32) -> CapTestError {
    CapTestError::InvalidArgument(format!("time window of {days} days is out of range"))
}

/// Drop rows falling on any of the given calendar days.
pub fn drop_days(index: &[NaiveDateTime], rows: &[usize], days: &[NaiveDate]) -> Vec<usize> {
    retain(rows, |r| !days.contains(&index[r].date()))
}

/// Keep rows where every power-factor column has `|pf| >= pf_min`.
pub fn power_factor(columns: &[&[f64]], rows: &[usize], pf_min: f64) -> Vec<usize> {
    retain(rows, |r| columns.iter().all(|c| c[r].abs() >= pf_min))
}

/// Keep rows strictly below `threshold`.
pub fn below(values: &[f64], rows: &[usize], threshold: f64) -> Vec<usize> {
    retain(rows, |r| values[r] < threshold)
}

/// Keep rows with no `NaN` in any of the columns.
pub fn complete(columns: &[&[f64]], rows: &[usize]) -> Vec<usize> {
    retain(rows, |r| columns.iter().all(|c| !c[r].is_nan()))
}

/// Keep rows where every column is exactly zero.
pub fn all_zero(columns: &[&[f64]], rows: &[usize]) -> Vec<usize> {
    retain(rows, |r| columns.iter().all(|c| c[r] == 0.0))
}

/// Keep rows whose `numerator / reference` ratio lies in `[low, high]`.
pub fn ratio(
    numerator: &[f64],
    reference: &[f64],
    rows: &[usize],
    low: f64,
    high: f64,
) -> Vec<usize> {
    retain(rows, |r| {
        let q = numerator[r] / reference[r];
        q.is_finite() && q >= low && q <= high
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    #[test]
    fn irradiance_absolute_and_relative() {
        let poa = [100.0, 400.0, 500.0, 600.0, f64::NAN, 900.0];
        assert_eq!(irradiance(&poa, &all(6), 400.0, 600.0, None), vec![1, 2, 3]);
        assert_eq!(irradiance(&poa, &all(6), 0.8, 1.2, Some(500.0)), vec![1, 2, 3]);
        assert_eq!(irradiance(&poa, &[0, 2], 400.0, 600.0, None), vec![2]);
    }

    #[test]
    fn sensors_must_agree_pairwise() {
        let a = [100.0, 100.0, 100.0];
        let b = [101.0, 120.0, 100.0];
        let c = [100.0, 100.0, f64::NAN];
        assert_eq!(sensors_agree(&[&a, &b, &c], &all(3), 0.05), vec![0]);
        assert_eq!(sensors_agree(&[&a, &b], &all(3), 0.05), vec![0, 2]);
    }

    #[test]
    fn perc_difference_is_relative_to_mean() {
        assert!((perc_difference(90.0, 110.0) - 0.2).abs() < 1e-12);
        assert_eq!(perc_difference(0.0, 0.0), 0.0);
    }

    #[test]
    fn outliers_drops_farthest_point() {
        let x: Vec<f64> = (0..20).map(|i| 100.0 + 40.0 * i as f64).collect();
        let mut y: Vec<f64> = x.iter().map(|v| 5.0 * v).collect();
        y[7] = 0.0;
        let kept = outliers(&x, &y, &all(20), 0.05);
        assert_eq!(kept.len(), 19);
        assert!(!kept.contains(&7));
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 8, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn time_window_resolves_each_form() {
        let index = vec![at(1, 0), at(10, 0)];
        let window = TimeWindow {
            start: Some(at(2, 0)),
            days: Some(3),
            ..Default::default()
        };
        assert_eq!(window.resolve(&index).unwrap(), (at(2, 0), at(5, 0)));

        let window = TimeWindow {
            end: Some(at(9, 0)),
            days: Some(2),
            ..Default::default()
        };
        assert_eq!(window.resolve(&index).unwrap(), (at(7, 0), at(9, 0)));

        let window = TimeWindow {
            test_date: Some(at(5, 0)),
            days: Some(4),
            ..Default::default()
        };
        assert_eq!(window.resolve(&index).unwrap(), (at(3, 0), at(7, 0)));

        let window = TimeWindow {
            start: Some(at(4, 0)),
            ..Default::default()
        };
        assert_eq!(window.resolve(&index).unwrap(), (at(4, 0), at(10, 0)));

        assert!(TimeWindow::default().resolve(&index).is_err());
        assert!(TimeWindow::between(at(5, 0), at(4, 0)).resolve(&index).is_err());
    }

    #[test]
    fn time_window_out_of_range_is_an_error() {
        let index = vec![at(1, 0), at(10, 0)];
        let window = TimeWindow {
            test_date: Some(at(5, 0)),
            days: Some(u32::MAX),
            ..Default::default()
        };
        assert!(matches!(window.resolve(&index), Err(CapTestError::InvalidArgument(_))));
        let window = TimeWindow {
            end: Some(at(5, 0)),
            days: Some(u32::MAX),
            ..Default::default()
        };
        assert!(window.resolve(&index).is_err());
    }

    #[test]
    fn power_factor_checks_every_column_by_magnitude() {
        let pf1 = [0.999, -0.998, 0.95, 1.0, f64::NAN];
        let pf2 = [1.0, 0.999, 1.0, 0.97, 1.0];
        assert_eq!(power_factor(&[&pf1, &pf2], &all(5), 0.99), vec![0, 1]);
        assert_eq!(power_factor(&[&pf1], &[1, 2, 3], 0.99), vec![1, 3]);
    }

    #[test]
    fn time_window_keeps_or_drops_inclusive() {
        let index: Vec<NaiveDateTime> = (0..6).map(|h| at(1, h)).collect();
        assert_eq!(time_window(&index, &all(6), at(1, 1), at(1, 3), false), vec![1, 2, 3]);
        assert_eq!(time_window(&index, &all(6), at(1, 1), at(1, 3), true), vec![0, 4, 5]);
        let days = [NaiveDate::from_ymd_opt(2022, 8, 1).unwrap()];
        assert!(drop_days(&index, &all(6), &days).is_empty());
    }

    #[test]
    fn ratio_band_ignores_division_by_zero() {
        let num = [50.0, 100.0, 130.0, 10.0];
        let den = [100.0, 100.0, 100.0, 0.0];
        assert_eq!(ratio(&num, &den, &all(4), 0.9, 1.2), vec![1]);
    }

    #[test]
    fn all_zero_and_complete() {
        let loss = [0.0, 1.0, 0.0];
        let other = [1.0, 2.0, f64::NAN];
        assert_eq!(all_zero(&[&loss], &all(3)), vec![0, 2]);
        assert_eq!(complete(&[&loss, &other], &all(3)), vec![0, 1]);
    }
}
