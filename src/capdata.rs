use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};

use crate::data::aggregate::{agg_column_name, aggregate_columns, AggFunc};
use crate::data::filter::{self, TimeWindow};
use crate::data::groups::ColumnGroups;
use crate::data::model::{Row, TimeSeriesFrame};
use crate::error::{CapTestError, Result};
use crate::regression::{self, Formula, RegressionResults};
use crate::rep_cond::{self, RcConfig, ReportingCondition};

/// Variables of the capacity regression.
pub const REGRESSION_VARIABLES: [&str; 4] = ["power", "poa", "t_amb", "w_vel"];

/// Regression variable → column name or column-group id.
pub type RegressionColumns = BTreeMap<String, String>;

/// PVsyst inverter-limit loss columns, in either naming style.
const PVSYST_LOSS_COLUMNS: [[&str; 2]; 4] = [
    ["IL Pmin", "IL_Pmin"],
    ["IL Vmin", "IL_Vmin"],
    ["IL Pmax", "IL_Pmax"],
    ["IL Vmax", "IL_Vmax"],
];

// ---------------------------------------------------------------------------
// Filter history
// ---------------------------------------------------------------------------

/// One entry of the filtering history.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRecord {
    pub name: String,
    pub args: String,
    pub pts_before: usize,
    pub pts_after: usize,
    /// Timestamps removed by this step.
    pub removed: Vec<NaiveDateTime>,
}

impl FilterRecord {
    pub fn pts_removed(&self) -> usize {
        self.pts_before - self.pts_after
    }
}

/// Table of filtering steps, printed by [`CapData::summary`].
pub struct Summary<'a> {
    name: &'a str,
    steps: &'a [FilterRecord],
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return writeln!(f, "No filters have been run.");
        }
        writeln!(
            f,
            "{:<10} {:<16} {:>15} {:>14}  {}",
            "", "filter", "pts_after", "pts_removed", "filter_arguments"
        )?;
        for step in self.steps {
            writeln!(
                f,
                "{:<10} {:<16} {:>15} {:>14}  {}",
                self.name,
                step.name,
                step.pts_after,
                step.pts_removed(),
                step.args
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CapData
// ---------------------------------------------------------------------------

/// A measured or simulated dataset moving through a capacity test.
///
/// The raw frame is never modified by filters: they narrow `kept`, the
/// positions of rows that pass every step so far, and append to the
/// history.
#[derive(Debug, Clone)]
pub struct CapData {
    pub name: String,
    data: TimeSeriesFrame,
    kept: Vec<usize>,
    pub column_groups: ColumnGroups,
    pub regression_cols: RegressionColumns,
    pub regression_formula: Formula,
    steps: Vec<FilterRecord>,
    pub rc: Option<Vec<ReportingCondition>>,
    pub regression_results: Option<RegressionResults>,
}

impl CapData {
    pub fn new(name: &str, data: TimeSeriesFrame, column_groups: ColumnGroups) -> Self {
        let kept = (0..data.len()).collect();
        CapData {
            name: name.to_string(),
            data,
            kept,
            column_groups,
            regression_cols: RegressionColumns::new(),
            regression_formula: Formula::default(),
            steps: Vec::new(),
            rc: None,
            regression_results: None,
        }
    }

    /// The unfiltered data.
    pub fn data(&self) -> &TimeSeriesFrame {
        &self.data
    }

    /// Positions of the rows passing every filter so far.
    pub fn kept_rows(&self) -> &[usize] {
        &self.kept
    }

    /// A copy of the rows passing every filter so far.
    pub fn filtered(&self) -> TimeSeriesFrame {
        self.data.take_rows(&self.kept)
    }

    pub fn set_regression_cols(&mut self, power: &str, poa: &str, t_amb: &str, w_vel: &str) {
        self.regression_cols = REGRESSION_VARIABLES
            .iter()
            .zip([power, poa, t_amb, w_vel])
            .map(|(var, key)| (var.to_string(), key.to_string()))
            .collect();
    }

    // -- column resolution -------------------------------------------------

    /// Raw columns behind a column name or a group id.
    pub fn columns_for(&self, key: &str) -> Result<Vec<String>> {
        if self.data.has_column(key) {
            return Ok(vec![key.to_string()]);
        }
        self.column_groups
            .get(key)
            .map(|cols| cols.to_vec())
            .ok_or_else(|| CapTestError::GroupNotFound(key.to_string()))
    }

    /// The single raw column behind a regression variable, group id or
    /// column name.
    pub fn single_column(&self, key: &str) -> Result<String> {
        let key = self.regression_cols.get(key).map_or(key, String::as_str);
        let mut cols = self.columns_for(key)?;
        match cols.len() {
            1 => Ok(cols.remove(0)),
            count => Err(CapTestError::AmbiguousColumn {
                name: key.to_string(),
                count,
            }),
        }
    }

    fn regression_column(&self, var: &str) -> Result<String> {
        if !self.regression_cols.contains_key(var) {
            return Err(CapTestError::RegressionColumnMissing(var.to_string()));
        }
        self.single_column(var)
    }

    fn values(&self, column: &str) -> Result<&[f64]> {
        self.data.try_column(column)
    }

    /// Columns of the given groups (or raw column names).
    pub fn view(&self, keys: &[&str], filtered: bool) -> Result<TimeSeriesFrame> {
        let mut cols = Vec::new();
        for key in keys {
            cols.extend(self.columns_for(key)?);
        }
        let names: Vec<&str> = cols.iter().map(String::as_str).collect();
        let frame = self.data.select(&names)?;
        Ok(if filtered {
            frame.take_rows(&self.kept)
        } else {
            frame
        })
    }

    /// Columns behind regression variables, e.g. `["poa", "t_amb"]`.
    pub fn rview(&self, vars: &[&str], filtered: bool) -> Result<TimeSeriesFrame> {
        let mut keys = Vec::with_capacity(vars.len());
        for var in vars {
            let key = self
                .regression_cols
                .get(*var)
                .ok_or_else(|| CapTestError::RegressionColumnMissing(var.to_string()))?;
            keys.push(key.as_str());
        }
        self.view(&keys, filtered)
    }

    /// Values of regression variables at the given rows, keyed by variable.
    fn regression_data(&self, vars: &[&str], rows: &[usize]) -> Result<BTreeMap<String, Vec<f64>>> {
        let mut out = BTreeMap::new();
        for var in vars {
            let col = self.regression_column(var)?;
            let values = self.values(&col)?;
            out.insert(var.to_string(), rows.iter().map(|&r| values[r]).collect());
        }
        Ok(out)
    }

    /// Remove raw columns from the data and from every group.
    pub fn drop_cols(&mut self, columns: &[&str]) {
        for col in columns {
            if !self.data.drop_column(col) {
                log::warn!("{}: cannot drop missing column {col}", self.name);
            }
        }
        self.column_groups.drop_columns(columns);
    }

    // -- aggregation -------------------------------------------------------

    /// Combine the columns of each group into a new `<group>_<func>_agg`
    /// column, registered as a group of its own. Regression variables that
    /// pointed at an aggregated group are repointed to the new column.
    pub fn agg_sensors(&mut self, agg_map: &BTreeMap<String, AggFunc>) -> Result<()> {
        for (group, func) in agg_map {
            let cols = self
                .column_groups
                .get(group)
                .ok_or_else(|| CapTestError::GroupNotFound(group.clone()))?
                .to_vec();
            let slices: Vec<&[f64]> = cols
                .iter()
                .map(|c| self.values(c))
                .collect::<Result<_>>()?;
            let values = aggregate_columns(&slices, *func)?;

            let name = agg_column_name(group, *func);
            self.data.insert_column(&name, values)?;
            self.column_groups.insert(&name, vec![name.clone()]);
            for key in self.regression_cols.values_mut() {
                if *key == *group {
                    *key = name.clone();
                }
            }
            log::info!("{}: aggregated {} columns of {group} into {name}", self.name, cols.len());
        }
        Ok(())
    }

    // -- filtering ---------------------------------------------------------

    fn apply_filter(
        &mut self,
        name: &str,
        args: String,
        select: impl FnOnce(&Self) -> Result<Vec<usize>>,
    ) -> Result<()> {
        let kept = select(self)?;
        if self.steps.is_empty() {
            self.steps.push(FilterRecord {
                name: "count".to_string(),
                args: "no filters".to_string(),
                pts_before: self.data.len(),
                pts_after: self.kept.len(),
                removed: Vec::new(),
            });
        }
        let remaining: HashSet<usize> = kept.iter().copied().collect();
        let removed: Vec<NaiveDateTime> = self
            .kept
            .iter()
            .filter(|&&r| !remaining.contains(&r))
            .map(|&r| self.data.index()[r])
            .collect();

        let record = FilterRecord {
            name: name.to_string(),
            args: if args.is_empty() {
                "no arguments".to_string()
            } else {
                args
            },
            pts_before: self.kept.len(),
            pts_after: kept.len(),
            removed,
        };
        log::info!(
            "{}: {}({}) removed {} points, {} remain",
            self.name,
            record.name,
            record.args,
            record.pts_removed(),
            record.pts_after
        );
        if kept.is_empty() {
            log::warn!("{}: {} removed every remaining point", self.name, record.name);
        }
        self.steps.push(record);
        self.kept = kept;
        Ok(())
    }

    /// Forget every filter.
    pub fn reset_filter(&mut self) {
        self.kept = (0..self.data.len()).collect();
        self.steps.clear();
    }

    pub fn steps(&self) -> &[FilterRecord] {
        &self.steps
    }

    pub fn summary(&self) -> Summary<'_> {
        Summary {
            name: &self.name,
            steps: &self.steps,
        }
    }

    /// Keep rows with irradiance in `[low, high]`, or in
    /// `[low * ref_val, high * ref_val]` when `ref_val` is given. Uses the
    /// `poa` regression column unless `column` names another.
    pub fn filter_irr(
        &mut self,
        low: f64,
        high: f64,
        ref_val: Option<f64>,
        column: Option<&str>,
    ) -> Result<()> {
        let col = match column {
            Some(c) => self.single_column(c)?,
            None => self.regression_column("poa")?,
        };
        let args = match ref_val {
            Some(r) => format!("{low}, {high}, ref_val={r}"),
            None => format!("{low}, {high}"),
        };
        self.apply_filter("filter_irr", args, |cd| {
            Ok(filter::irradiance(cd.values(&col)?, &cd.kept, low, high, ref_val))
        })
    }

    /// For each group, drop rows where any two of its sensors differ by
    /// more than the given fraction of their mean.
    pub fn filter_sensors(&mut self, perc_diff: &BTreeMap<String, f64>) -> Result<()> {
        let args = perc_diff
            .iter()
            .map(|(g, p)| format!("{g}: {p}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.apply_filter("filter_sensors", args, |cd| {
            let mut rows = cd.kept.clone();
            for (group, &limit) in perc_diff {
                let cols = cd.columns_for(group)?;
                if cols.len() < 2 {
                    log::debug!("{group} has a single sensor; nothing to compare");
                    continue;
                }
                let slices: Vec<&[f64]> =
                    cols.iter().map(|c| cd.values(c)).collect::<Result<_>>()?;
                rows = filter::sensors_agree(&slices, &rows, limit);
            }
            Ok(rows)
        })
    }

    /// Keep rows the predicate accepts.
    pub fn filter_custom<F>(&mut self, name: &str, predicate: F) -> Result<()>
    where
        F: FnMut(&Row<'_>) -> bool,
    {
        self.apply_filter("filter_custom", name.to_string(), |cd| {
            Ok(filter::custom(&cd.data, &cd.kept, predicate))
        })
    }

    /// Drop the `contamination` fraction of points lying farthest from the
    /// centre of the poa / power cloud.
    pub fn filter_outliers(&mut self, contamination: f64) -> Result<()> {
        let poa = self.regression_column("poa")?;
        let power = self.regression_column("power")?;
        self.apply_filter("filter_outliers", format!("contamination={contamination}"), |cd| {
            Ok(filter::outliers(
                cd.values(&poa)?,
                cd.values(&power)?,
                &cd.kept,
                contamination,
            ))
        })
    }

    pub fn filter_time(&mut self, window: &TimeWindow) -> Result<()> {
        let (start, end) = window.resolve(self.data.index())?;
        let args = format!(
            "start={start}, end={end}{}",
            if window.drop { ", drop=true" } else { "" }
        );
        self.apply_filter("filter_time", args, |cd| {
            Ok(filter::time_window(cd.data.index(), &cd.kept, start, end, window.drop))
        })
    }

    /// Drop whole calendar days.
    pub fn filter_days(&mut self, days: &[NaiveDate]) -> Result<()> {
        let args = days.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ");
        self.apply_filter("filter_days", args, |cd| {
            Ok(filter::drop_days(cd.data.index(), &cd.kept, days))
        })
    }

    /// Keep rows where every power-factor column reads at least `pf` in
    /// magnitude.
    pub fn filter_pf(&mut self, pf: f64) -> Result<()> {
        let cols: Vec<String> = self
            .column_groups
            .iter()
            .filter(|(group, _)| group.starts_with("pf"))
            .flat_map(|(_, cols)| cols.iter().cloned())
            .collect();
        if cols.is_empty() {
            return Err(CapTestError::GroupNotFound("pf".to_string()));
        }
        self.apply_filter("filter_pf", format!("{pf}"), |cd| {
            let slices: Vec<&[f64]> = cols.iter().map(|c| cd.values(c)).collect::<Result<_>>()?;
            Ok(filter::power_factor(&slices, &cd.kept, pf))
        })
    }

    /// Keep rows with power below `threshold`, or below `threshold *
    /// percent` when a percent is given.
    pub fn filter_power(&mut self, threshold: f64, percent: Option<f64>) -> Result<()> {
        let col = self.regression_column("power")?;
        let limit = threshold * percent.unwrap_or(1.0);
        let args = match percent {
            Some(p) => format!("{threshold}, percent={p}"),
            None => format!("{threshold}"),
        };
        self.apply_filter("filter_power", args, |cd| {
            Ok(filter::below(cd.values(&col)?, &cd.kept, limit))
        })
    }

    /// Drop rows with a missing value in the given columns or groups, by
    /// default every column behind the regression variables.
    pub fn filter_missing(&mut self, columns: Option<&[&str]>) -> Result<()> {
        let keys: Vec<String> = match columns {
            Some(cols) => cols.iter().map(|c| c.to_string()).collect(),
            None => self.regression_cols.values().cloned().collect(),
        };
        let mut cols = Vec::new();
        for key in &keys {
            cols.extend(self.columns_for(key)?);
        }
        self.apply_filter("filter_missing", keys.join(", "), |cd| {
            let slices: Vec<&[f64]> = cols.iter().map(|c| cd.values(c)).collect::<Result<_>>()?;
            Ok(filter::complete(&slices, &cd.kept))
        })
    }

    /// Keep rows where no PVsyst inverter-limit loss is reported.
    pub fn filter_pvsyst(&mut self) -> Result<()> {
        let mut cols = Vec::new();
        for names in PVSYST_LOSS_COLUMNS {
            match names.iter().find(|n| self.data.has_column(n)) {
                Some(found) => cols.push(found.to_string()),
                None => log::warn!("{} is not a column in the data.", names[0]),
            }
        }
        self.apply_filter("filter_pvsyst", String::new(), |cd| {
            let slices: Vec<&[f64]> = cols.iter().map(|c| cd.values(c)).collect::<Result<_>>()?;
            Ok(filter::all_zero(&slices, &cd.kept))
        })
    }

    /// Keep rows whose PVsyst near-shading factor `FShdBm` is at least
    /// `fshdbm` (1.0 means unshaded).
    pub fn filter_shade(&mut self, fshdbm: f64) -> Result<()> {
        let col = self.single_column("FShdBm")?;
        self.apply_filter("filter_shade", format!("fshdbm={fshdbm}"), |cd| {
            Ok(filter::band(cd.values(&col)?, &cd.kept, fshdbm, f64::INFINITY))
        })
    }

    /// Keep rows where `numerator / reference` lies in `[low, high]`. Both
    /// may be regression variables, groups or columns.
    pub fn filter_ratio(&mut self, numerator: &str, reference: &str, low: f64, high: f64) -> Result<()> {
        let num = self.single_column(numerator)?;
        let den = self.single_column(reference)?;
        self.apply_filter(
            "filter_ratio",
            format!("{numerator} / {reference}, {low}, {high}"),
            |cd| Ok(filter::ratio(cd.values(&num)?, cd.values(&den)?, &cd.kept, low, high)),
        )
    }

    // -- regression --------------------------------------------------------

    /// Fit the regression formula to the filtered (or all) data.
    pub fn fit_regression(&mut self, filtered: bool) -> Result<&RegressionResults> {
        let rows: Vec<usize> = if filtered {
            self.kept.clone()
        } else {
            (0..self.data.len()).collect()
        };
        let vars = self.regression_formula.variables();
        let data = self.regression_data(&vars, &rows)?;
        let results = regression::fit(&self.regression_formula, &data)?;
        log::info!(
            "{}: fitted {} on {} points, R-squared {:.4}",
            self.name,
            self.regression_formula,
            results.nobs,
            results.r_squared
        );
        Ok(self.regression_results.insert(results))
    }

    // -- reporting conditions ----------------------------------------------

    /// Compute and store reporting conditions from the filtered data.
    pub fn rep_cond(&mut self, cfg: &RcConfig) -> Result<&[ReportingCondition]> {
        let data = self.regression_data(&["poa", "t_amb", "w_vel"], &self.kept)?;
        let index: Vec<NaiveDateTime> = self.kept.iter().map(|&r| self.data.index()[r]).collect();
        let rcs = rep_cond::reporting_conditions(
            &index,
            &data["poa"],
            &data["t_amb"],
            &data["w_vel"],
            cfg,
        )?;
        for rc in &rcs {
            log::info!("{}: reporting conditions {rc}", self.name);
        }
        Ok(self.rc.insert(rcs))
    }

    /// For each reporting condition, fit the regression to the filtered
    /// points of its period and predict capacity at that condition.
    /// Periods too short to fit are skipped with a warning.
    pub fn predict_capacities(&self) -> Result<Vec<CapacityPrediction>> {
        let rcs = self.rc.as_ref().ok_or_else(|| {
            CapTestError::ReportingConditions(format!("{} has no reporting conditions", self.name))
        })?;
        let vars = self.regression_formula.variables();

        let mut out = Vec::with_capacity(rcs.len());
        for rc in rcs {
            let rows: Vec<usize> = match &rc.period {
                Some(period) => self
                    .kept
                    .iter()
                    .copied()
                    .filter(|&r| period.contains(self.data.index()[r]))
                    .collect(),
                None => self.kept.clone(),
            };
            let data = self.regression_data(&vars, &rows)?;
            let model = match regression::fit(&self.regression_formula, &data) {
                Ok(model) => model,
                Err(e) => {
                    log::warn!("{}: skipping {rc}: {e}", self.name);
                    continue;
                }
            };
            let capacity = model.predict(|v| rc.get(v))?;
            out.push(CapacityPrediction {
                rc: *rc,
                nobs: model.nobs,
                r_squared: model.r_squared,
                capacity,
            });
        }
        Ok(out)
    }
}

/// Capacity predicted at one reporting condition.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityPrediction {
    pub rc: ReportingCondition,
    pub nobs: usize,
    pub r_squared: f64,
    pub capacity: f64,
}

impl fmt::Display for CapacityPrediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  points: {}  R-squared: {:.4}  capacity: {:.3}",
            self.rc, self.nobs, self.r_squared, self.capacity
        )
    }
}
