use anyhow::{Context, Result};

use crate::capdata::{CapData, CapacityPrediction};
use crate::config::{DataKind, DatasetConfig, TestConfig};
use crate::data::loader::{load_data, load_pvsyst, LoadOptions, PvsystOptions};
use crate::rep_cond::RcConfig;
use crate::results::{captest_results, captest_results_check_pvalues, CapTestResults, PvalueCheck};

/// Everything a finished capacity test produced.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub measured: CapData,
    pub simulated: CapData,
    pub results: CapTestResults,
    pub pvalue_check: Option<PvalueCheck>,
    /// Per-period capacities, when reporting conditions were per period.
    pub period_capacities: Vec<CapacityPrediction>,
}

/// Load one dataset as configured.
pub fn load_dataset(cfg: &DatasetConfig, default_name: &str) -> Result<CapData> {
    let name = cfg.name.clone().unwrap_or_else(|| default_name.to_string());
    let mut cd = match cfg.kind {
        DataKind::Measured => {
            let opts = LoadOptions {
                name,
                column_groups: cfg.column_groups.clone(),
                clear_sky: cfg.clear_sky.clone(),
                ..Default::default()
            };
            load_data(&cfg.path, &opts)?
        }
        DataKind::Pvsyst => {
            if cfg.clear_sky.is_some() {
                log::warn!("{name}: clear-sky modelling applies to measured data only; ignored");
            }
            let mut opts = PvsystOptions {
                name,
                egrid_unit_adj_factor: cfg.egrid_unit_adj_factor,
                set_regression_columns: cfg.regression_cols.is_none(),
                ..Default::default()
            };
            if let Some(delim) = cfg.delimiter {
                opts.delimiter = u8::try_from(delim)
                    .ok()
                    .filter(u8::is_ascii)
                    .with_context(|| format!("delimiter '{delim}' is not a single ASCII character"))?;
            }
            load_pvsyst(&cfg.path, &opts)?
        }
    };
    if let Some(cols) = &cfg.regression_cols {
        cd.set_regression_cols(&cols.power, &cols.poa, &cols.t_amb, &cols.w_vel);
    }
    if let Some(formula) = &cfg.formula {
        cd.regression_formula = formula.clone();
    }
    Ok(cd)
}

/// Aggregate, filter, fit and, when configured, compute reporting
/// conditions.
pub fn prepare(cd: &mut CapData, cfg: &DatasetConfig) -> Result<()> {
    let name = cd.name.clone();
    if !cfg.aggregate.is_empty() {
        cd.agg_sensors(&cfg.aggregate)
            .with_context(|| format!("{name}: aggregating sensors"))?;
    }
    for (i, step) in cfg.filters.iter().enumerate() {
        step.apply(cd)
            .with_context(|| format!("{name}: filter step {} ({step:?})", i + 1))?;
    }
    cd.fit_regression(true)
        .with_context(|| format!("{name}: fitting regression"))?;
    if let Some(rc_cfg) = &cfg.rep_cond {
        cd.rep_cond(rc_cfg)
            .with_context(|| format!("{name}: reporting conditions"))?;
    }
    log::info!("{name}: {} of {} points kept", cd.kept_rows().len(), cd.data().len());
    Ok(())
}

/// Run a whole capacity test.
///
/// When the reporting conditions are per period, the comparison uses
/// conditions recomputed over the whole filtered set and the per-period
/// capacities are reported alongside.
pub fn run(cfg: &TestConfig) -> Result<TestOutcome> {
    let mut measured = load_dataset(&cfg.measured, "das")?;
    let mut simulated = load_dataset(&cfg.simulated, "pvsyst")?;
    prepare(&mut measured, &cfg.measured)?;
    prepare(&mut simulated, &cfg.simulated)?;

    let mut period_capacities = Vec::new();
    for (cd, ds_cfg) in [(&mut measured, &cfg.measured), (&mut simulated, &cfg.simulated)] {
        let Some(rc_cfg) = ds_cfg.rep_cond.as_ref().filter(|c| c.freq.is_some()) else {
            continue;
        };
        let name = cd.name.clone();
        period_capacities.extend(
            cd.predict_capacities()
                .with_context(|| format!("{name}: per-period capacities"))?,
        );
        let overall = RcConfig {
            freq: None,
            ..rc_cfg.clone()
        };
        cd.rep_cond(&overall)
            .with_context(|| format!("{name}: reporting conditions"))?;
    }

    let results = captest_results(
        &simulated,
        &measured,
        cfg.nameplate,
        &cfg.tolerance,
        cfg.check_pvalues,
        cfg.pval,
    )?;
    let pvalue_check = if cfg.report_pvalues {
        Some(captest_results_check_pvalues(
            &simulated,
            &measured,
            cfg.nameplate,
            &cfg.tolerance,
            cfg.pval,
        )?)
    } else {
        None
    };

    Ok(TestOutcome {
        measured,
        simulated,
        results,
        pvalue_check,
        period_capacities,
    })
}
