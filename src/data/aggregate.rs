use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CapTestError, Result};

/// How the columns of a group are combined into one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Sum,
    Mean,
    Median,
    Min,
    Max,
}

impl AggFunc {
    /// Combine one row's values, skipping `NaN`. A row of only `NaN`
    /// yields `NaN`.
    pub fn apply(self, values: &[f64]) -> f64 {
        let mut present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if present.is_empty() {
            return f64::NAN;
        }
        match self {
            AggFunc::Sum => present.iter().sum(),
            AggFunc::Mean => present.iter().sum::<f64>() / present.len() as f64,
            AggFunc::Median => {
                present.sort_by(f64::total_cmp);
                let mid = present.len() / 2;
                if present.len() % 2 == 0 {
                    (present[mid - 1] + present[mid]) / 2.0
                } else {
                    present[mid]
                }
            }
            AggFunc::Min => present.iter().copied().fold(f64::INFINITY, f64::min),
            AggFunc::Max => present.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Mean => "mean",
            AggFunc::Median => "median",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggFunc {
    type Err = CapTestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(AggFunc::Sum),
            "mean" => Ok(AggFunc::Mean),
            "median" => Ok(AggFunc::Median),
            "min" => Ok(AggFunc::Min),
            "max" => Ok(AggFunc::Max),
            other => Err(CapTestError::InvalidArgument(format!(
                "unknown aggregation function: {other}"
            ))),
        }
    }
}

/// Name of the column holding an aggregated group.
pub fn agg_column_name(group: &str, func: AggFunc) -> String {
    format!("{group}_{func}_agg")
}

/// Combine equally long columns row by row.
pub fn aggregate_columns(columns: &[&[f64]], func: AggFunc) -> Result<Vec<f64>> {
    let Some(first) = columns.first() else {
        return Err(CapTestError::InvalidArgument(
            "no columns to aggregate".to_string(),
        ));
    };
    let n = first.len();
    if let Some(bad) = columns.iter().find(|c| c.len() != n) {
        return Err(CapTestError::LengthMismatch {
            expected: n,
            found: bad.len(),
        });
    }
    let mut row = Vec::with_capacity(columns.len());
    Ok((0..n)
        .map(|r| {
            row.clear();
            row.extend(columns.iter().map(|c| c[r]));
            func.apply(&row)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_skip_nan() {
        let a = [1.0, f64::NAN, 5.0];
        let b = [3.0, 4.0, f64::NAN];
        let mean = aggregate_columns(&[&a, &b], AggFunc::Mean).unwrap();
        assert_eq!(mean, vec![2.0, 4.0, 5.0]);
        let sum = aggregate_columns(&[&a, &b], AggFunc::Sum).unwrap();
        assert_eq!(sum, vec![4.0, 4.0, 5.0]);
    }

    #[test]
    fn all_nan_row_is_nan() {
        assert!(AggFunc::Max.apply(&[f64::NAN, f64::NAN]).is_nan());
    }

    #[test]
    fn median_of_even_count_averages_middle() {
        assert_eq!(AggFunc::Median.apply(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(AggFunc::Median.apply(&[9.0, 1.0, 3.0]), 3.0);
    }

    #[test]
    fn parse_and_name() {
        assert_eq!("Mean".parse::<AggFunc>().unwrap(), AggFunc::Mean);
        assert!("avg".parse::<AggFunc>().is_err());
        assert_eq!(agg_column_name("irr_poa", AggFunc::Mean), "irr_poa_mean_agg");
    }

    #[test]
    fn mismatched_lengths_error() {
        let a = [1.0, 2.0];
        let b = [1.0];
        assert!(aggregate_columns(&[&a, &b], AggFunc::Sum).is_err());
    }
}
