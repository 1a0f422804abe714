use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capdata::CapData;
use crate::error::{CapTestError, Result};
use crate::regression::RegressionResults;
use crate::rep_cond::ReportingCondition;

// ---------------------------------------------------------------------------
// Tolerance
// ---------------------------------------------------------------------------

/// Acceptance band around the nameplate, in percent.
///
/// `"+/- 5"` and `"-/+ 5"` accept 95 % to 105 %; `"- 5"` accepts anything
/// from 95 % up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tolerance {
    pub percent: f64,
    pub upper_bounded: bool,
}

impl Tolerance {
    /// `(lower, upper)` capacity bounds; `upper` is `None` when unbounded.
    pub fn bounds(&self, nameplate: f64) -> (f64, Option<f64>) {
        let frac = self.percent / 100.0;
        let lower = nameplate * (1.0 - frac);
        let upper = self.upper_bounded.then(|| nameplate * (1.0 + frac));
        (lower, upper)
    }

    /// Whether a tested capacity passes. Values are compared at three
    /// decimals.
    pub fn passes(&self, tested: f64, nameplate: f64) -> bool {
        let (lower, upper) = self.bounds(nameplate);
        let tested = round3(tested);
        round3(lower) <= tested && upper.map_or(true, |u| tested <= round3(u))
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

impl FromStr for Tolerance {
    type Err = CapTestError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CapTestError::InvalidTolerance(s.to_string());
        let (sign, value) = s.trim().split_once(char::is_whitespace).ok_or_else(invalid)?;
        let percent: f64 = value.trim().parse().map_err(|_| invalid())?;
        if !percent.is_finite() || percent < 0.0 {
            return Err(invalid());
        }
        let upper_bounded = match sign {
            "+/-" | "-/+" => true,
            "-" => false,
            _ => return Err(invalid()),
        };
        Ok(Tolerance {
            percent,
            upper_bounded,
        })
    }
}

impl TryFrom<String> for Tolerance {
    type Error = CapTestError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Tolerance> for String {
    fn from(t: Tolerance) -> String {
        t.to_string()
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.upper_bounded { "+/-" } else { "-" };
        write!(f, "{sign} {}", self.percent)
    }
}

// ---------------------------------------------------------------------------
// Capacity test results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CapTestResults {
    /// Name of the dataset the reporting conditions came from.
    pub rc_source: String,
    pub rc: ReportingCondition,
    /// Measured regression evaluated at the reporting conditions.
    pub actual: f64,
    /// Simulated regression evaluated at the reporting conditions.
    pub expected: f64,
    pub cap_ratio: f64,
    pub tested_capacity: f64,
    pub nameplate: f64,
    pub tolerance: Tolerance,
    pub bounds: (f64, Option<f64>),
    pub passed: bool,
}

impl fmt::Display for CapTestResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Using reporting conditions from {}.", self.rc_source)?;
        writeln!(f, "{}", self.rc)?;
        writeln!(f)?;
        let verdict = if self.passed { "PASS" } else { "FAIL" };
        writeln!(f, "{:<28}{verdict}", "Capacity Test Result:")?;
        writeln!(f, "{:<28}{:.3}", "Modeled test output:", self.expected)?;
        writeln!(f, "{:<28}{:.3}", "Actual test output:", self.actual)?;
        writeln!(f, "{:<28}{:.3}", "Tested output ratio:", self.cap_ratio)?;
        writeln!(f, "{:<28}{:.3}", "Tested Capacity:", self.tested_capacity)?;
        match self.bounds.1 {
            Some(upper) => writeln!(f, "{:<28}{:.3}, {:.3}", "Bounds:", self.bounds.0, upper),
            None => writeln!(f, "{:<28}{:.3}, inf", "Bounds:", self.bounds.0),
        }
    }
}

fn fitted<'a>(cd: &'a CapData) -> Result<&'a RegressionResults> {
    cd.regression_results
        .as_ref()
        .ok_or_else(|| CapTestError::NotFitted(cd.name.clone()))
}

/// The single reporting condition to compare at and the dataset holding
/// it. Exactly one of the two datasets may carry reporting conditions.
fn pick_rc<'a>(sim: &'a CapData, das: &'a CapData) -> Result<(&'a str, ReportingCondition)> {
    let (source, rcs) = match (&sim.rc, &das.rc) {
        (Some(_), Some(_)) => {
            return Err(CapTestError::ReportingConditions(format!(
                "both {} and {} have reporting conditions; keep only one",
                sim.name, das.name
            )))
        }
        (None, None) => {
            return Err(CapTestError::ReportingConditions(
                "neither dataset has reporting conditions".to_string(),
            ))
        }
        (Some(rcs), None) => (sim.name.as_str(), rcs),
        (None, Some(rcs)) => (das.name.as_str(), rcs),
    };
    match rcs.as_slice() {
        [rc] if rc.period.is_none() => Ok((source, *rc)),
        _ => Err(CapTestError::ReportingConditions(format!(
            "{source} has {} per-period reporting conditions; the comparison needs one",
            rcs.len()
        ))),
    }
}

/// Compare measured against simulated capacity at the reporting conditions.
///
/// With `check_pvalues`, coefficients whose p-value exceeds `pval` are set
/// to zero in both models before predicting.
pub fn captest_results(
    sim: &CapData,
    das: &CapData,
    nameplate: f64,
    tolerance: &Tolerance,
    check_pvalues: bool,
    pval: f64,
) -> Result<CapTestResults> {
    if sim.regression_formula != das.regression_formula {
        return Err(CapTestError::FormulaMismatch {
            sim: sim.regression_formula.to_string(),
            das: das.regression_formula.to_string(),
        });
    }
    let (mut sim_model, mut das_model) = (fitted(sim)?.clone(), fitted(das)?.clone());
    if check_pvalues {
        sim_model = sim_model.with_insignificant_zeroed(pval);
        das_model = das_model.with_insignificant_zeroed(pval);
    }
    let (source, rc) = pick_rc(sim, das)?;

    let actual = das_model.predict(|v| rc.get(v))?;
    let expected = sim_model.predict(|v| rc.get(v))?;
    let cap_ratio = actual / expected;
    if cap_ratio < 0.01 {
        log::warn!(
            "capacity ratio {cap_ratio:.5} is below 0.01; check that measured and \
             simulated power use the same units"
        );
    }
    let tested_capacity = nameplate * cap_ratio;

    Ok(CapTestResults {
        rc_source: source.to_string(),
        rc,
        actual,
        expected,
        cap_ratio,
        tested_capacity,
        nameplate,
        tolerance: *tolerance,
        bounds: tolerance.bounds(nameplate),
        passed: tolerance.passes(tested_capacity, nameplate),
    })
}

// ---------------------------------------------------------------------------
// p-value check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PvalueRow {
    pub term: String,
    pub das_coef: f64,
    pub das_pvalue: f64,
    pub sim_coef: f64,
    pub sim_pvalue: f64,
}

/// Coefficients and p-values of both models, plus the test run with all
/// coefficients and with only the significant ones.
#[derive(Debug, Clone, PartialEq)]
pub struct PvalueCheck {
    pub pval: f64,
    pub table: Vec<PvalueRow>,
    pub all_coefficients: CapTestResults,
    pub significant_only: CapTestResults,
}

impl PvalueCheck {
    /// Terms whose p-value exceeds the threshold in either model.
    pub fn insignificant_terms(&self) -> Vec<&str> {
        self.table
            .iter()
            .filter(|row| row.das_pvalue > self.pval || row.sim_pvalue > self.pval)
            .map(|row| row.term.as_str())
            .collect()
    }
}

impl fmt::Display for PvalueCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<20} {:>14} {:>10} {:>14} {:>10}",
            "term", "das coef", "das p", "sim coef", "sim p"
        )?;
        let flag = |p: f64| if p > self.pval { "*" } else { " " };
        for row in &self.table {
            writeln!(
                f,
                "{:<20} {:>14.6e} {:>9.4}{} {:>14.6e} {:>9.4}{}",
                row.term,
                row.das_coef,
                row.das_pvalue,
                flag(row.das_pvalue),
                row.sim_coef,
                row.sim_pvalue,
                flag(row.sim_pvalue)
            )?;
        }
        writeln!(f, "* p-value above {}", self.pval)?;
        writeln!(f)?;
        writeln!(f, "Results using all coefficients:")?;
        write!(f, "{}", self.all_coefficients)?;
        writeln!(f)?;
        writeln!(f, "Results using only coefficients with p-value <= {}:", self.pval)?;
        write!(f, "{}", self.significant_only)
    }
}

pub fn captest_results_check_pvalues(
    sim: &CapData,
    das: &CapData,
    nameplate: f64,
    tolerance: &Tolerance,
    pval: f64,
) -> Result<PvalueCheck> {
    let all_coefficients = captest_results(sim, das, nameplate, tolerance, false, pval)?;
    let significant_only = captest_results(sim, das, nameplate, tolerance, true, pval)?;

    let (sim_model, das_model) = (fitted(sim)?, fitted(das)?);
    let table = das_model
        .terms
        .iter()
        .enumerate()
        .map(|(i, term)| PvalueRow {
            term: term.clone(),
            das_coef: das_model.coefficients[i],
            das_pvalue: das_model.p_values[i],
            sim_coef: sim_model.coefficients[i],
            sim_pvalue: sim_model.p_values[i],
        })
        .collect();

    Ok(PvalueCheck {
        pval,
        table,
        all_coefficients,
        significant_only,
    })
}
