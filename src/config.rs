use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::capdata::CapData;
use crate::data::aggregate::AggFunc;
use crate::data::csky::ClearSkyConfig;
use crate::data::filter::TimeWindow;
use crate::regression::Formula;
use crate::rep_cond::RcConfig;
use crate::results::Tolerance;

// ---------------------------------------------------------------------------
// Test configuration
// ---------------------------------------------------------------------------

/// A whole capacity test, read from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Nameplate capacity, in the units of the power columns.
    pub nameplate: f64,
    pub tolerance: Tolerance,
    #[serde(default = "default_pval")]
    pub pval: f64,
    /// Zero coefficients with p-values above `pval` before comparing.
    #[serde(default)]
    pub check_pvalues: bool,
    /// Print the coefficient p-value table with both comparisons.
    #[serde(default)]
    pub report_pvalues: bool,
    pub measured: DatasetConfig,
    pub simulated: DatasetConfig,
}

fn default_pval() -> f64 {
    0.05
}

impl TestConfig {
    pub fn from_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg: TestConfig =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        if let Some(base) = path.parent() {
            cfg.measured.resolve_paths(base);
            cfg.simulated.resolve_paths(base);
        }
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// Logger CSV or Parquet files.
    #[default]
    Measured,
    /// A PVsyst hourly export.
    Pvsyst,
}

/// Regression variable mapping; each value is a column name or group id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionColumnsConfig {
    pub power: String,
    pub poa: String,
    pub t_amb: String,
    pub w_vel: String,
}

/// One dataset of the test and the steps it goes through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: Option<String>,
    /// File or directory; relative paths are resolved against the config file.
    pub path: PathBuf,
    #[serde(default)]
    pub kind: DataKind,
    /// JSON column groups. Inferred from the column names when absent.
    pub column_groups: Option<PathBuf>,
    /// PVsyst loads default to `E_Grid`, `GlobInc`, `T_Amb`, `WindVel`.
    pub regression_cols: Option<RegressionColumnsConfig>,
    pub formula: Option<Formula>,
    /// Group id → aggregation, applied before filtering.
    #[serde(default)]
    pub aggregate: BTreeMap<String, AggFunc>,
    /// Filters, applied in order.
    #[serde(default)]
    pub filters: Vec<FilterStep>,
    /// Compute reporting conditions from this dataset.
    pub rep_cond: Option<RcConfig>,
    /// `E_Grid` divisor for PVsyst data.
    pub egrid_unit_adj_factor: Option<f64>,
    /// Field delimiter of a PVsyst export, `,` when absent.
    pub delimiter: Option<char>,
    /// Site and array for modelled clear-sky columns (measured data only).
    pub clear_sky: Option<ClearSkyConfig>,
}

impl DatasetConfig {
    fn resolve_paths(&mut self, base: &Path) {
        if self.path.is_relative() {
            self.path = base.join(&self.path);
        }
        if let Some(groups) = &mut self.column_groups {
            if groups.is_relative() {
                *groups = base.join(&*groups);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Filter steps
// ---------------------------------------------------------------------------

/// Comparison used by [`FilterStep::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn eval(self, a: f64, b: f64) -> bool {
        match self {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }
}

fn default_contamination() -> f64 {
    0.04
}

fn default_fshdbm() -> f64 {
    1.0
}

/// One filtering step, tagged by `"filter"` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum FilterStep {
    Irradiance {
        low: f64,
        high: f64,
        ref_val: Option<f64>,
        column: Option<String>,
    },
    Sensors {
        perc_diff: BTreeMap<String, f64>,
    },
    Outliers {
        #[serde(default = "default_contamination")]
        contamination: f64,
    },
    Time(TimeWindow),
    Days {
        days: Vec<NaiveDate>,
    },
    PowerFactor {
        pf: f64,
    },
    Power {
        threshold: f64,
        percent: Option<f64>,
    },
    Missing {
        columns: Option<Vec<String>>,
    },
    Pvsyst,
    Shade {
        #[serde(default = "default_fshdbm")]
        fshdbm: f64,
    },
    Ratio {
        numerator: String,
        reference: String,
        low: f64,
        high: f64,
    },
    /// Keep rows where `column <op> value`; a missing value never passes.
    Custom {
        column: String,
        op: CompareOp,
        value: f64,
    },
}

impl FilterStep {
    pub fn apply(&self, cd: &mut CapData) -> crate::error::Result<()> {
        match self {
            FilterStep::Irradiance {
                low,
                high,
                ref_val,
                column,
            } => cd.filter_irr(*low, *high, *ref_val, column.as_deref()),
            FilterStep::Sensors { perc_diff } => cd.filter_sensors(perc_diff),
            FilterStep::Outliers { contamination } => cd.filter_outliers(*contamination),
            FilterStep::Time(window) => cd.filter_time(window),
            FilterStep::Days { days } => cd.filter_days(days),
            FilterStep::PowerFactor { pf } => cd.filter_pf(*pf),
            FilterStep::Power { threshold, percent } => cd.filter_power(*threshold, *percent),
            FilterStep::Missing { columns } => {
                let names: Option<Vec<&str>> = columns
                    .as_ref()
                    .map(|cols| cols.iter().map(String::as_str).collect());
                cd.filter_missing(names.as_deref())
            }
            FilterStep::Pvsyst => cd.filter_pvsyst(),
            FilterStep::Shade { fshdbm } => cd.filter_shade(*fshdbm),
            FilterStep::Ratio {
                numerator,
                reference,
                low,
                high,
            } => cd.filter_ratio(numerator, reference, *low, *high),
            FilterStep::Custom { column, op, value } => {
                let col = cd.single_column(column)?;
                let (op, value) = (*op, *value);
                let label = format!("{column} {} {value}", op.symbol());
                cd.filter_custom(&label, |row| {
                    row.get(&col).is_some_and(|v| op.eval(v, value))
                })
            }
        }
    }
}
