use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::error::{CapTestError, Result};

/// The ASTM E2848 capacity regression.
pub const ASTM_FORMULA: &str = "power ~ poa + I(poa * poa) + I(poa * t_amb) + I(poa * w_vel) - 1";

// ---------------------------------------------------------------------------
// Formula
// ---------------------------------------------------------------------------

/// One right-hand-side term: a variable or a product of variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Var(String),
    Product(Vec<String>),
}

impl Term {
    pub fn variables(&self) -> &[String] {
        match self {
            Term::Var(v) => std::slice::from_ref(v),
            Term::Product(vs) => vs,
        }
    }

    /// Evaluate the term. `None` when a variable is unknown.
    pub fn eval(&self, lookup: &impl Fn(&str) -> Option<f64>) -> Option<f64> {
        self.variables()
            .iter()
            .try_fold(1.0, |acc, v| lookup(v).map(|x| acc * x))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(v) => f.write_str(v),
            Term::Product(vs) => write!(f, "I({})", vs.join(" * ")),
        }
    }
}

/// A regression formula in the patsy subset used for capacity tests:
/// `lhs ~ term + term ...`, where a term is a variable, `I(a * b ...)` or
/// `a:b`. An intercept is included unless the formula ends in `- 1` or
/// `+ 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Formula {
    pub response: String,
    pub terms: Vec<Term>,
    pub intercept: bool,
}

impl Default for Formula {
    fn default() -> Self {
        Formula {
            response: "power".to_string(),
            terms: vec![
                Term::Var("poa".to_string()),
                Term::Product(vec!["poa".to_string(), "poa".to_string()]),
                Term::Product(vec!["poa".to_string(), "t_amb".to_string()]),
                Term::Product(vec!["poa".to_string(), "w_vel".to_string()]),
            ],
            intercept: false,
        }
    }
}

impl Formula {
    /// Column names of the design matrix, `Intercept` first when present.
    pub fn term_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.terms.len() + 1);
        if self.intercept {
            names.push("Intercept".to_string());
        }
        names.extend(self.terms.iter().map(|t| t.to_string()));
        names
    }

    /// Every variable referenced, response first, without repeats.
    pub fn variables(&self) -> Vec<&str> {
        let mut vars = vec![self.response.as_str()];
        for v in self.terms.iter().flat_map(|t| t.variables()) {
            if !vars.contains(&v.as_str()) {
                vars.push(v);
            }
        }
        vars
    }

    /// Variables on the right-hand side only.
    pub fn regressors(&self) -> Vec<&str> {
        self.variables()
            .into_iter()
            .filter(|v| *v != self.response)
            .collect()
    }

    /// One design-matrix row.
    pub fn design_row(&self, lookup: &impl Fn(&str) -> Option<f64>) -> Option<Vec<f64>> {
        let mut row = Vec::with_capacity(self.terms.len() + 1);
        if self.intercept {
            row.push(1.0);
        }
        for term in &self.terms {
            row.push(term.eval(lookup)?);
        }
        Some(row)
    }
}

impl FromStr for Formula {
    type Err = CapTestError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| CapTestError::InvalidFormula {
            formula: s.to_string(),
            reason: reason.to_string(),
        };

        let (lhs, rhs) = s.split_once('~').ok_or_else(|| invalid("missing '~'"))?;
        if rhs.contains('~') {
            return Err(invalid("more than one '~'"));
        }
        let response = lhs.trim();
        if !is_identifier(response) {
            return Err(invalid("left-hand side must be a single variable"));
        }

        let mut terms = Vec::new();
        let mut intercept = true;
        for (sign, text) in split_terms(rhs).map_err(|r| invalid(&r))? {
            match (sign, text.as_str()) {
                ('-', "1") | ('+', "0") => intercept = false,
                ('+', "1") => intercept = true,
                ('-', _) => return Err(invalid("only '- 1' may be subtracted")),
                (_, text) => {
                    let term = parse_term(text).map_err(|r| invalid(&r))?;
                    if terms.contains(&term) {
                        return Err(invalid(&format!("duplicate term {term}")));
                    }
                    terms.push(term);
                }
            }
        }
        if terms.is_empty() && !intercept {
            return Err(invalid("no terms"));
        }

        Ok(Formula {
            response: response.to_string(),
            terms,
            intercept,
        })
    }
}

impl TryFrom<String> for Formula {
    type Error = CapTestError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Formula> for String {
    fn from(f: Formula) -> String {
        f.to_string()
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ ", self.response)?;
        let terms: Vec<String> = self.terms.iter().map(|t| t.to_string()).collect();
        f.write_str(&terms.join(" + "))?;
        if !self.intercept {
            f.write_str(if terms.is_empty() { "0" } else { " - 1" })?;
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split the right-hand side at top-level `+` / `-`.
fn split_terms(rhs: &str) -> std::result::Result<Vec<(char, String)>, String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut sign = '+';
    let mut current = String::new();
    for c in rhs.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced parentheses".to_string());
                }
                current.push(c);
            }
            '+' | '-' if depth == 0 => {
                let text = current.trim();
                if text.is_empty() {
                    if !out.is_empty() || sign != '+' {
                        return Err(format!("empty term before '{c}'"));
                    }
                } else {
                    out.push((sign, text.to_string()));
                }
                sign = c;
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses".to_string());
    }
    let text = current.trim();
    if text.is_empty() {
        return Err("formula ends with an operator".to_string());
    }
    out.push((sign, text.to_string()));
    Ok(out)
}

fn parse_term(text: &str) -> std::result::Result<Term, String> {
    let factors: Vec<&str> = if let Some(inner) = text
        .strip_prefix("I(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        inner.split('*').map(str::trim).collect()
    } else if text.contains(':') {
        text.split(':').map(str::trim).collect()
    } else {
        vec![text]
    };

    if let Some(bad) = factors.iter().find(|f| !is_identifier(f)) {
        return Err(format!("unsupported term '{bad}'"));
    }
    Ok(match factors.as_slice() {
        [single] => Term::Var(single.to_string()),
        _ => Term::Product(factors.iter().map(|f| f.to_string()).collect()),
    })
}

// ---------------------------------------------------------------------------
// Ordinary least squares
// ---------------------------------------------------------------------------

/// A fitted OLS model.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionResults {
    pub formula: Formula,
    pub terms: Vec<String>,
    pub coefficients: Vec<f64>,
    pub std_errors: Vec<f64>,
    pub t_values: Vec<f64>,
    pub p_values: Vec<f64>,
    pub r_squared: f64,
    pub adj_r_squared: f64,
    pub df_resid: usize,
    pub nobs: usize,
}

/// Fit `formula` to the named columns. Rows with `NaN` in any variable are
/// skipped.
pub fn fit(formula: &Formula, data: &BTreeMap<String, Vec<f64>>) -> Result<RegressionResults> {
    let mut columns = Vec::new();
    for var in formula.variables() {
        let col = data
            .get(var)
            .ok_or_else(|| CapTestError::RegressionColumnMissing(var.to_string()))?;
        columns.push((var, col.as_slice()));
    }
    let n = columns[0].1.len();
    if let Some((_, bad)) = columns.iter().find(|(_, c)| c.len() != n) {
        return Err(CapTestError::LengthMismatch {
            expected: n,
            found: bad.len(),
        });
    }

    let mut x = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    for r in 0..n {
        let lookup = |name: &str| {
            columns
                .iter()
                .find(|(v, _)| *v == name)
                .map(|(_, c)| c[r])
                .filter(|v| !v.is_nan())
        };
        let Some(target) = lookup(formula.response.as_str()) else {
            continue;
        };
        if let Some(row) = formula.design_row(&lookup) {
            x.push(row);
            y.push(target);
        }
    }
    if x.len() < n {
        log::debug!("regression skipped {} rows with missing values", n - x.len());
    }
    ols(formula, &x, &y)
}

/// Least squares on an explicit design matrix (`x` is row-major).
pub fn ols(formula: &Formula, x: &[Vec<f64>], y: &[f64]) -> Result<RegressionResults> {
    let terms = formula.term_names();
    let p = terms.len();
    let n = y.len();
    if n <= p {
        return Err(CapTestError::InsufficientData(format!(
            "{n} observations for {p} coefficients"
        )));
    }

    let mut xtx = vec![vec![0.0; p]; p];
    let mut xty = vec![0.0; p];
    for (row, &target) in x.iter().zip(y) {
        for i in 0..p {
            xty[i] += row[i] * target;
            for j in i..p {
                xtx[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 0..p {
        for j in 0..i {
            xtx[i][j] = xtx[j][i];
        }
    }

    let inv = invert_scaled(&xtx)?;
    let coefficients: Vec<f64> = (0..p)
        .map(|i| (0..p).map(|j| inv[i][j] * xty[j]).sum())
        .collect();

    let fitted: Vec<f64> = x
        .iter()
        .map(|row| row.iter().zip(&coefficients).map(|(a, b)| a * b).sum())
        .collect();
    let sse: f64 = y.iter().zip(&fitted).map(|(a, b)| (a - b).powi(2)).sum();
    let df_resid = n - p;
    let sigma2 = sse / df_resid as f64;

    let tss = if formula.intercept {
        let mean = y.iter().sum::<f64>() / n as f64;
        y.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
    } else {
        y.iter().map(|v| v * v).sum::<f64>()
    };
    let r_squared = 1.0 - sse / tss;
    let k_const = usize::from(formula.intercept);
    let adj_r_squared = 1.0 - (1.0 - r_squared) * (n - k_const) as f64 / df_resid as f64;

    let dist = StudentsT::new(0.0, 1.0, df_resid as f64)
        .map_err(|e| CapTestError::Statistics(e.to_string()))?;
    let std_errors: Vec<f64> = (0..p).map(|i| (sigma2 * inv[i][i]).sqrt()).collect();
    let t_values: Vec<f64> = coefficients
        .iter()
        .zip(&std_errors)
        .map(|(b, se)| b / se)
        .collect();
    let p_values: Vec<f64> = t_values
        .iter()
        .map(|t| {
            if t.is_nan() {
                f64::NAN
            } else {
                (2.0 * dist.cdf(-t.abs())).min(1.0)
            }
        })
        .collect();

    Ok(RegressionResults {
        formula: formula.clone(),
        terms,
        coefficients,
        std_errors,
        t_values,
        p_values,
        r_squared,
        adj_r_squared,
        df_resid,
        nobs: n,
    })
}

/// Invert a symmetric positive semi-definite matrix after scaling it to a
/// unit diagonal, which keeps the pivot tolerance meaningful when the
/// terms differ by orders of magnitude (poa vs poa²).
fn invert_scaled(a: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    let p = a.len();
    let mut d = Vec::with_capacity(p);
    for (i, row) in a.iter().enumerate() {
        if row[i] <= 0.0 || !row[i].is_finite() {
            return Err(CapTestError::SingularMatrix(format!(
                "design column {i} is all zero or not finite"
            )));
        }
        d.push(row[i].sqrt());
    }
    let scaled: Vec<Vec<f64>> = (0..p)
        .map(|i| (0..p).map(|j| a[i][j] / (d[i] * d[j])).collect())
        .collect();
    let inv = gauss_jordan(&scaled)?;
    Ok((0..p)
        .map(|i| (0..p).map(|j| inv[i][j] / (d[i] * d[j])).collect())
        .collect())
}

/// Gauss-Jordan elimination with partial pivoting.
fn gauss_jordan(a: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    const PIVOT_TOL: f64 = 1e-12;
    let n = a.len();
    let mut aug: Vec<Vec<f64>> = a
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut r = row.clone();
            r.extend((0..n).map(|j| if i == j { 1.0 } else { 0.0 }));
            r
        })
        .collect();

    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&i, &j| aug[i][col].abs().total_cmp(&aug[j][col].abs()))
            .unwrap_or(col);
        if aug[pivot_row][col].abs() < PIVOT_TOL {
            return Err(CapTestError::SingularMatrix(format!(
                "no pivot in column {col}; terms are linearly dependent"
            )));
        }
        aug.swap(col, pivot_row);

        let pivot = aug[col][col];
        for v in &mut aug[col] {
            *v /= pivot;
        }
        for row in 0..n {
            if row != col {
                let factor = aug[row][col];
                if factor != 0.0 {
                    for k in 0..2 * n {
                        aug[row][k] -= factor * aug[col][k];
                    }
                }
            }
        }
    }

    Ok(aug.into_iter().map(|row| row[n..].to_vec()).collect())
}

impl RegressionResults {
    pub fn coefficient(&self, term: &str) -> Option<f64> {
        self.terms
            .iter()
            .position(|t| t == term)
            .map(|i| self.coefficients[i])
    }

    pub fn p_value(&self, term: &str) -> Option<f64> {
        self.terms
            .iter()
            .position(|t| t == term)
            .map(|i| self.p_values[i])
    }

    /// Predict the response for one set of regressor values.
    pub fn predict(&self, lookup: impl Fn(&str) -> Option<f64>) -> Result<f64> {
        if let Some(missing) = self.formula.regressors().into_iter().find(|v| lookup(v).is_none()) {
            return Err(CapTestError::RegressionColumnMissing(missing.to_string()));
        }
        let row = self
            .formula
            .design_row(&lookup)
            .ok_or_else(|| CapTestError::InvalidArgument("incomplete regressor values".into()))?;
        Ok(row.iter().zip(&self.coefficients).map(|(a, b)| a * b).sum())
    }

    /// A copy with every coefficient whose p-value exceeds `pval` set to zero.
    pub fn with_insignificant_zeroed(&self, pval: f64) -> Self {
        let mut out = self.clone();
        for (coef, p) in out.coefficients.iter_mut().zip(&self.p_values) {
            if *p > pval {
                *coef = 0.0;
            }
        }
        out
    }
}

impl fmt::Display for RegressionResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.formula)?;
        writeln!(
            f,
            "nobs: {}  df_resid: {}  R-squared: {:.4}  adj. R-squared: {:.4}",
            self.nobs, self.df_resid, self.r_squared, self.adj_r_squared
        )?;
        writeln!(
            f,
            "{:<20} {:>14} {:>12} {:>10} {:>8}",
            "term", "coef", "std err", "t", "P>|t|"
        )?;
        for i in 0..self.terms.len() {
            writeln!(
                f,
                "{:<20} {:>14.6e} {:>12.4e} {:>10.3} {:>8.3}",
                self.terms[i],
                self.coefficients[i],
                self.std_errors[i],
                self.t_values[i],
                self.p_values[i]
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_formula_is_astm() {
        let parsed: Formula = ASTM_FORMULA.parse().unwrap();
        assert_eq!(parsed, Formula::default());
        assert_eq!(parsed.to_string(), ASTM_FORMULA);
        assert_eq!(parsed.variables(), vec!["power", "poa", "t_amb", "w_vel"]);
        assert_eq!(
            parsed.term_names(),
            vec!["poa", "I(poa * poa)", "I(poa * t_amb)", "I(poa * w_vel)"]
        );
    }

    #[test]
    fn parse_intercept_and_interactions() {
        let f: Formula = "power ~ poa + poa:t_amb".parse().unwrap();
        assert!(f.intercept);
        assert_eq!(f.term_names(), vec!["Intercept", "poa", "I(poa * t_amb)"]);
        let f: Formula = "power ~ poa + 0".parse().unwrap();
        assert!(!f.intercept);
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in [
            "power poa",
            "power ~ poa - t_amb",
            "power ~ I(poa * (t_amb)",
            "power ~ poa +",
            "power ~ poa + poa",
            "power ~ log(poa)",
        ] {
            assert!(bad.parse::<Formula>().is_err(), "{bad}");
        }
    }

    fn astm_data(noise: impl Fn(usize) -> f64) -> BTreeMap<String, Vec<f64>> {
        let (a1, a2, a3, a4) = (5.0, -1e-4, -0.01, 0.03);
        let mut cols: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for i in 0..60 {
            let poa = 300.0 + 10.0 * i as f64;
            let t_amb = 15.0 + (i % 7) as f64 * 2.5;
            let w_vel = 1.0 + (i % 5) as f64 * 0.8;
            let power = poa * (a1 + a2 * poa + a3 * t_amb + a4 * w_vel) + noise(i);
            cols.entry("poa".into()).or_default().push(poa);
            cols.entry("t_amb".into()).or_default().push(t_amb);
            cols.entry("w_vel".into()).or_default().push(w_vel);
            cols.entry("power".into()).or_default().push(power);
        }
        cols
    }

    #[test]
    fn recovers_exact_coefficients() {
        let res = fit(&Formula::default(), &astm_data(|_| 0.0)).unwrap();
        let expected = [5.0, -1e-4, -0.01, 0.03];
        for (got, want) in res.coefficients.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6 * want.abs(), "{got} vs {want}");
        }
        assert!((res.r_squared - 1.0).abs() < 1e-12);
        assert_eq!(res.nobs, 60);
        assert_eq!(res.df_resid, 56);
    }

    #[test]
    fn p_values_are_probabilities() {
        let res = fit(&Formula::default(), &astm_data(|i| ((i * 37 % 11) as f64 - 5.0) * 3.0))
            .unwrap();
        for p in &res.p_values {
            assert!((0.0..=1.0).contains(p), "{p}");
        }
        assert!(res.p_value("poa").unwrap() < 0.05);
        assert!(res.r_squared > 0.99 && res.r_squared <= 1.0);
    }

    #[test]
    fn skips_nan_rows() {
        let mut data = astm_data(|_| 0.0);
        data.get_mut("t_amb").unwrap()[3] = f64::NAN;
        data.get_mut("power").unwrap()[4] = f64::NAN;
        let res = fit(&Formula::default(), &data).unwrap();
        assert_eq!(res.nobs, 58);
    }

    #[test]
    fn intercept_model_matches_line() {
        let f: Formula = "power ~ poa".parse().unwrap();
        let poa: Vec<f64> = (0..10).map(f64::from).collect();
        let power: Vec<f64> = poa.iter().map(|x| 2.0 + 3.0 * x).collect();
        let data = BTreeMap::from([("poa".to_string(), poa), ("power".to_string(), power)]);
        let res = fit(&f, &data).unwrap();
        assert!((res.coefficient("Intercept").unwrap() - 2.0).abs() < 1e-9);
        assert!((res.coefficient("poa").unwrap() - 3.0).abs() < 1e-9);
        let pred = res.predict(|v| (v == "poa").then_some(10.0)).unwrap();
        assert!((pred - 32.0).abs() < 1e-9);
    }

    #[test]
    fn singular_and_short_inputs_error() {
        let f: Formula = "power ~ a + b - 1".parse().unwrap();
        let a: Vec<f64> = (1..=10).map(f64::from).collect();
        let data = BTreeMap::from([
            ("a".to_string(), a.clone()),
            ("b".to_string(), a.iter().map(|v| 2.0 * v).collect()),
            ("power".to_string(), a.clone()),
        ]);
        assert!(matches!(fit(&f, &data), Err(CapTestError::SingularMatrix(_))));

        let short = BTreeMap::from([
            ("a".to_string(), vec![1.0, 2.0]),
            ("b".to_string(), vec![1.0, 3.0]),
            ("power".to_string(), vec![1.0, 2.0]),
        ]);
        assert!(matches!(fit(&f, &short), Err(CapTestError::InsufficientData(_))));
    }

    #[test]
    fn zeroing_insignificant_coefficients() {
        let res = fit(&Formula::default(), &astm_data(|i| ((i * 37 % 11) as f64 - 5.0) * 3.0))
            .unwrap();
        let zeroed = res.with_insignificant_zeroed(0.0);
        assert!(zeroed.coefficients.iter().zip(&res.p_values).all(|(c, p)| *p == 0.0 || *c == 0.0));
        let kept = res.with_insignificant_zeroed(1.0);
        assert_eq!(kept.coefficients, res.coefficients);
    }
}
