use std::fmt;

use chrono::{Datelike, Months, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{CapTestError, Result};

// ---------------------------------------------------------------------------
// Aggregation of one variable
// ---------------------------------------------------------------------------

/// How one reporting-condition variable is computed from filtered data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RcFunc {
    Mean,
    Median,
    /// Percentile (0-100) using the nearest rank.
    Percentile(f64),
    /// A fixed value, ignoring the data.
    Value(f64),
}

impl RcFunc {
    /// Apply to the non-`NaN` values. `NaN` when there are none.
    pub fn apply(self, values: &[f64]) -> f64 {
        if let RcFunc::Value(v) = self {
            return v;
        }
        let mut present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if present.is_empty() {
            return f64::NAN;
        }
        match self {
            RcFunc::Mean => present.iter().sum::<f64>() / present.len() as f64,
            RcFunc::Median => {
                present.sort_by(f64::total_cmp);
                let mid = present.len() / 2;
                if present.len() % 2 == 0 {
                    (present[mid - 1] + present[mid]) / 2.0
                } else {
                    present[mid]
                }
            }
            RcFunc::Percentile(p) => {
                present.sort_by(f64::total_cmp);
                percentile_sorted(&present, p)
            }
            RcFunc::Value(v) => v,
        }
    }
}

/// Nearest-rank percentile of sorted values; halfway ranks round to even.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    sorted[rank.round_ties_even() as usize]
}

/// Nearest-rank percentile, skipping `NaN`.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    RcFunc::Percentile(p).apply(values)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Periods for which separate reporting conditions are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RcFrequency {
    Monthly,
    /// Calendar quarters starting January, April, July and October.
    Quarterly,
}

impl RcFrequency {
    /// The period holding `ts`.
    pub fn period_of(self, ts: NaiveDateTime) -> Period {
        let month0 = match self {
            RcFrequency::Monthly => ts.month0(),
            RcFrequency::Quarterly => ts.month0() / 3 * 3,
        };
        let step = match self {
            RcFrequency::Monthly => Months::new(1),
            RcFrequency::Quarterly => Months::new(3),
        };
        let first = NaiveDate::from_ymd_opt(ts.year(), month0 + 1, 1)
            .unwrap_or(ts.date())
            .and_time(chrono::NaiveTime::MIN);
        let end = first.checked_add_months(step).unwrap_or(NaiveDateTime::MAX);
        Period { start: first, end }
    }
}

/// Irradiance-balanced reporting conditions: the band `[low, high]` times
/// the candidate irradiance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IrrBalance {
    pub low: f64,
    pub high: f64,
}

impl Default for IrrBalance {
    fn default() -> Self {
        IrrBalance { low: 0.8, high: 1.2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcConfig {
    pub poa: RcFunc,
    pub t_amb: RcFunc,
    pub w_vel: RcFunc,
    pub freq: Option<RcFrequency>,
    pub irr_bal: Option<IrrBalance>,
    /// Overrides the computed wind speed.
    pub fixed_w_vel: Option<f64>,
}

impl Default for RcConfig {
    fn default() -> Self {
        RcConfig {
            poa: RcFunc::Percentile(60.0),
            t_amb: RcFunc::Mean,
            w_vel: RcFunc::Mean,
            freq: None,
            irr_bal: None,
            fixed_w_vel: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Half-open `[start, end)` time period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Period {
    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportingCondition {
    /// Set when the conditions were computed per period.
    pub period: Option<Period>,
    pub poa: f64,
    pub t_amb: f64,
    pub w_vel: f64,
}

impl ReportingCondition {
    /// Value of a regression variable.
    pub fn get(&self, var: &str) -> Option<f64> {
        match var {
            "poa" => Some(self.poa),
            "t_amb" => Some(self.t_amb),
            "w_vel" => Some(self.w_vel),
            _ => None,
        }
    }
}

impl fmt::Display for ReportingCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(period) = &self.period {
            write!(f, "{}  ", period.start.format("%Y-%m-%d"))?;
        }
        write!(
            f,
            "poa: {:.3}  t_amb: {:.3}  w_vel: {:.3}",
            self.poa, self.t_amb, self.w_vel
        )
    }
}

// ---------------------------------------------------------------------------
// Computation
// ---------------------------------------------------------------------------

/// Candidate irradiance and the positions of the points within its band.
///
/// Every nearest-rank percentile from 1 to 99 is tried. A candidate
/// qualifies when 40-60 % of the points in `[low * rc, high * rc]` lie below
/// it; the qualifying candidate with the most points wins, ties to the
/// lower irradiance.
pub fn irr_rc_balanced(poa: &[f64], low: f64, high: f64) -> Result<(f64, Vec<usize>)> {
    let mut sorted: Vec<f64> = poa.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return Err(CapTestError::InsufficientData(
            "no irradiance values to balance".to_string(),
        ));
    }
    sorted.sort_by(f64::total_cmp);

    let mut best: Option<(f64, usize)> = None;
    let mut tried: Vec<f64> = Vec::new();
    for p in 1..100 {
        let rc = percentile_sorted(&sorted, f64::from(p));
        if tried.contains(&rc) {
            continue;
        }
        tried.push(rc);

        let (lo, hi) = (low * rc, high * rc);
        let in_band = sorted.iter().filter(|&&v| v >= lo && v <= hi).count();
        if in_band == 0 {
            continue;
        }
        let below = sorted.iter().filter(|&&v| v >= lo && v < rc).count();
        let frac = below as f64 / in_band as f64;
        if (0.4..=0.6).contains(&frac) && best.map_or(true, |(_, n)| in_band > n) {
            best = Some((rc, in_band));
        }
    }

    let (rc, _) = best.ok_or_else(|| {
        CapTestError::ReportingConditions(
            "no irradiance splits its band 40-60 % below".to_string(),
        )
    })?;
    let (lo, hi) = (low * rc, high * rc);
    let rows = (0..poa.len())
        .filter(|&r| poa[r] >= lo && poa[r] <= hi)
        .collect();
    Ok((rc, rows))
}

fn pick(values: &[f64], rows: &[usize]) -> Vec<f64> {
    rows.iter().map(|&r| values[r]).collect()
}

fn single(
    poa: &[f64],
    t_amb: &[f64],
    w_vel: &[f64],
    rows: &[usize],
    cfg: &RcConfig,
    period: Option<Period>,
) -> Result<ReportingCondition> {
    let poa_vals = pick(poa, rows);
    let rc = match cfg.irr_bal {
        Some(bal) => {
            let (irr, band) = irr_rc_balanced(&poa_vals, bal.low, bal.high)?;
            let band_rows: Vec<usize> = band.iter().map(|&i| rows[i]).collect();
            ReportingCondition {
                period,
                poa: irr,
                t_amb: RcFunc::Mean.apply(&pick(t_amb, &band_rows)),
                w_vel: RcFunc::Mean.apply(&pick(w_vel, &band_rows)),
            }
        }
        None => ReportingCondition {
            period,
            poa: cfg.poa.apply(&poa_vals),
            t_amb: cfg.t_amb.apply(&pick(t_amb, rows)),
            w_vel: cfg.w_vel.apply(&pick(w_vel, rows)),
        },
    };
    let rc = ReportingCondition {
        w_vel: cfg.fixed_w_vel.unwrap_or(rc.w_vel),
        ..rc
    };
    if rc.poa.is_nan() || rc.t_amb.is_nan() || rc.w_vel.is_nan() {
        return Err(CapTestError::InsufficientData(format!(
            "reporting conditions undefined for {} points",
            rows.len()
        )));
    }
    Ok(rc)
}

/// Reporting conditions from aligned poa, temperature and wind values.
/// One condition overall, or one per period when a frequency is set.
pub fn reporting_conditions(
    index: &[NaiveDateTime],
    poa: &[f64],
    t_amb: &[f64],
    w_vel: &[f64],
    cfg: &RcConfig,
) -> Result<Vec<ReportingCondition>> {
    let n = index.len();
    if let Some(bad) = [poa.len(), t_amb.len(), w_vel.len()].into_iter().find(|&l| l != n) {
        return Err(CapTestError::LengthMismatch {
            expected: n,
            found: bad,
        });
    }
    if n == 0 {
        return Err(CapTestError::InsufficientData(
            "no points left to compute reporting conditions".to_string(),
        ));
    }

    let Some(freq) = cfg.freq else {
        let rows: Vec<usize> = (0..n).collect();
        return Ok(vec![single(poa, t_amb, w_vel, &rows, cfg, None)?]);
    };

    let mut periods: Vec<(Period, Vec<usize>)> = Vec::new();
    for (r, ts) in index.iter().enumerate() {
        let period = freq.period_of(*ts);
        match periods.iter_mut().find(|(p, _)| *p == period) {
            Some((_, rows)) => rows.push(r),
            None => periods.push((period, vec![r])),
        }
    }
    periods.sort_by_key(|(p, _)| p.start);

    periods
        .iter()
        .map(|(period, rows)| single(poa, t_amb, w_vel, rows, cfg, Some(*period)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(month: u32, day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, month, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64 * 100.0).collect();
        // rank 0.6 * 9 = 5.4 -> 5
        assert_eq!(percentile(&values, 60.0), 600.0);
        // rank 0.5 * 9 = 4.5 -> 4 (ties to even)
        assert_eq!(percentile(&values, 50.0), 500.0);
        assert_eq!(percentile(&values, 100.0), 1000.0);
        assert!(percentile(&[f64::NAN], 60.0).is_nan());
    }

    #[test]
    fn default_conditions() {
        let index: Vec<NaiveDateTime> = (1..=5).map(|d| at(8, d)).collect();
        let poa = [500.0, 600.0, 700.0, 800.0, 900.0];
        let t_amb = [20.0, 22.0, f64::NAN, 26.0, 28.0];
        let w_vel = [1.0, 2.0, 3.0, 4.0, 5.0];
        let rcs = reporting_conditions(&index, &poa, &t_amb, &w_vel, &RcConfig::default()).unwrap();
        assert_eq!(rcs.len(), 1);
        assert_eq!(rcs[0].poa, 700.0);
        assert_eq!(rcs[0].t_amb, 24.0);
        assert_eq!(rcs[0].w_vel, 3.0);
        assert!(rcs[0].period.is_none());
    }

    #[test]
    fn fixed_wind_overrides() {
        let index = vec![at(8, 1), at(8, 2)];
        let cfg = RcConfig {
            fixed_w_vel: Some(1.5),
            ..Default::default()
        };
        let rcs = reporting_conditions(&index, &[500.0, 600.0], &[20.0, 22.0], &[4.0, 4.0], &cfg)
            .unwrap();
        assert_eq!(rcs[0].w_vel, 1.5);
    }

    #[test]
    fn monthly_conditions() {
        let index = vec![at(7, 30), at(7, 31), at(8, 1), at(8, 2), at(9, 3)];
        let poa = [100.0, 200.0, 300.0, 400.0, 500.0];
        let cfg = RcConfig {
            poa: RcFunc::Mean,
            freq: Some(RcFrequency::Monthly),
            ..Default::default()
        };
        let rcs = reporting_conditions(&index, &poa, &[20.0; 5], &[1.0; 5], &cfg).unwrap();
        assert_eq!(rcs.len(), 3);
        assert_eq!(rcs[0].poa, 150.0);
        assert_eq!(rcs[1].poa, 350.0);
        let aug = rcs[1].period.unwrap();
        assert_eq!(aug.start, at(8, 1).date().and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(aug.end, at(9, 1).date().and_hms_opt(0, 0, 0).unwrap());
        assert!(aug.contains(at(8, 31)));
    }

    #[test]
    fn quarters_start_in_jan_apr_jul_oct() {
        let q = RcFrequency::Quarterly.period_of(at(8, 15));
        assert_eq!(q.start.date(), NaiveDate::from_ymd_opt(2022, 7, 1).unwrap());
        assert_eq!(q.end.date(), NaiveDate::from_ymd_opt(2022, 10, 1).unwrap());
    }

    #[test]
    fn quarterly_conditions_group_by_calendar_quarter() {
        // out of order on purpose; periods come back sorted
        let index = vec![at(10, 1), at(3, 31), at(1, 15), at(4, 1), at(6, 30), at(9, 30)];
        let poa = [900.0, 300.0, 100.0, 400.0, 600.0, 700.0];
        let t_amb = [10.0, 14.0, 12.0, 20.0, 30.0, 25.0];
        let cfg = RcConfig {
            poa: RcFunc::Mean,
            freq: Some(RcFrequency::Quarterly),
            ..Default::default()
        };
        let rcs = reporting_conditions(&index, &poa, &t_amb, &[2.0; 6], &cfg).unwrap();
        let starts: Vec<u32> = rcs.iter().map(|rc| rc.period.unwrap().start.month()).collect();
        assert_eq!(starts, vec![1, 4, 7, 10]);
        assert_eq!(rcs[0].poa, 200.0);
        assert_eq!(rcs[0].t_amb, 13.0);
        assert_eq!(rcs[1].poa, 500.0);
        assert_eq!(rcs[1].t_amb, 25.0);
        assert_eq!(rcs[2].poa, 700.0);
        assert_eq!(rcs[3].poa, 900.0);
        assert_eq!(rcs[3].period.unwrap().end.date(), NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
    }

    #[test]
    fn balanced_rc_splits_band() {
        let poa: Vec<f64> = (0..101).map(|i| 200.0 + 8.0 * i as f64).collect();
        let (rc, rows) = irr_rc_balanced(&poa, 0.8, 1.2).unwrap();
        let band: Vec<f64> = rows.iter().map(|&r| poa[r]).collect();
        let below = band.iter().filter(|&&v| v < rc).count() as f64;
        let frac = below / band.len() as f64;
        assert!((0.4..=0.6).contains(&frac), "{frac}");
        assert!(band.iter().all(|&v| v >= 0.8 * rc && v <= 1.2 * rc));
    }

    #[test]
    fn balanced_conditions_average_band() {
        let index: Vec<NaiveDateTime> = (0..101)
            .map(|i| at(8, 1) + chrono::Duration::minutes(i))
            .collect();
        let poa: Vec<f64> = (0..101).map(|i| 200.0 + 8.0 * i as f64).collect();
        let t_amb: Vec<f64> = poa.iter().map(|p| p / 40.0).collect();
        let cfg = RcConfig {
            irr_bal: Some(IrrBalance::default()),
            ..Default::default()
        };
        let rcs = reporting_conditions(&index, &poa, &t_amb, &vec![2.0; 101], &cfg).unwrap();
        let (rc, rows) = irr_rc_balanced(&poa, 0.8, 1.2).unwrap();
        let mean_t = rows.iter().map(|&r| t_amb[r]).sum::<f64>() / rows.len() as f64;
        assert_eq!(rcs[0].poa, rc);
        assert!((rcs[0].t_amb - mean_t).abs() < 1e-12);
        assert_eq!(rcs[0].w_vel, 2.0);
    }

    #[test]
    fn empty_input_errors() {
        assert!(reporting_conditions(&[], &[], &[], &[], &RcConfig::default()).is_err());
    }

    #[test]
    fn config_from_json() {
        let cfg: RcConfig =
            serde_json::from_str(r#"{"poa": {"percentile": 50}, "freq": "monthly"}"#).unwrap();
        assert_eq!(cfg.poa, RcFunc::Percentile(50.0));
        assert_eq!(cfg.t_amb, RcFunc::Mean);
        assert_eq!(cfg.freq, Some(RcFrequency::Monthly));
    }
}
