use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Array, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use parquet::arrow::ArrowWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

/// ASTM model used for both datasets; measured output is `DAS_SCALE` of it.
const COEFFS: [f64; 4] = [6.0, -1e-4, -0.01, 0.03];
const DAS_SCALE: f64 = 0.98;
const NAMEPLATE_KW: f64 = 5700.0;

fn astm_power(poa: f64, t_amb: f64, w_vel: f64) -> f64 {
    poa * (COEFFS[0] + COEFFS[1] * poa + COEFFS[2] * t_amb + COEFFS[3] * w_vel)
}

/// Clear-day irradiance shape between 06:00 and 18:00.
fn clear_sky(ts: NaiveDateTime) -> f64 {
    let hour = ts.time().signed_duration_since(chrono::NaiveTime::MIN).num_seconds() as f64 / 3600.0;
    (1050.0 * ((hour - 6.0) / 12.0 * std::f64::consts::PI).sin()).max(0.0)
}

/// Seeded sensor and weather noise, so every run writes the same files.
struct Noise {
    rng: StdRng,
}

impl Noise {
    fn seeded(seed: u64) -> Self {
        Noise {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Zero-mean Gaussian noise (Box-Muller).
    fn normal(&mut self, std_dev: f64) -> f64 {
        let u1: f64 = self.rng.random::<f64>().max(1e-15);
        let u2: f64 = self.rng.random();
        std_dev * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    fn chance(&mut self, p: f64) -> bool {
        self.rng.random_bool(p)
    }

    /// Uniform in `[low, high)`.
    fn between(&mut self, low: f64, high: f64) -> f64 {
        self.rng.random_range(low..high)
    }
}

/// One weather sample: irradiance, ambient temperature, wind speed.
fn weather(ts: NaiveDateTime, cloud: f64, noise: &mut Noise) -> (f64, f64, f64) {
    let poa = (clear_sky(ts) * cloud + noise.normal(5.0)).max(0.0);
    let t_amb = 22.0 + 8.0 * (clear_sky(ts) / 1050.0) + noise.normal(0.5);
    let w_vel = (2.5 + noise.normal(1.0)).clamp(0.0, 12.0);
    (poa, t_amb, w_vel)
}

struct Measured {
    index: Vec<NaiveDateTime>,
    columns: Vec<(&'static str, Vec<f64>)>,
}

fn generate_measured(noise: &mut Noise) -> Measured {
    let start = NaiveDate::from_ymd_opt(2022, 8, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    let names = [
        "met1_poa_ref_cell",
        "met2_poa_ref_cell",
        "met1_amb_temp",
        "met1_wind_speed",
        "meter_power_factor",
        "meter_real_power_kw",
    ];
    let mut columns: Vec<(&'static str, Vec<f64>)> = names.iter().map(|n| (*n, Vec::new())).collect();
    let mut index = Vec::new();

    let mut cloud = 1.0;
    for step in 0..14 * 24 * 4 {
        let ts = start + Duration::minutes(15 * step);
        if step % 96 == 0 {
            // a new day: mostly clear, sometimes overcast
            cloud = if noise.chance(0.2) { 0.4 } else { noise.between(0.95, 1.0) };
        }
        let (poa, t_amb, w_vel) = weather(ts, cloud, noise);
        let mut poa2 = poa * (1.0 + noise.normal(0.005));
        if noise.chance(0.01) {
            poa2 *= 0.7; // soiled or shaded reference cell
        }
        let mut power = DAS_SCALE * astm_power(poa, t_amb, w_vel) + noise.normal(15.0);
        if poa > 900.0 && noise.chance(0.05) {
            power *= 0.85; // curtailment
        }
        let pf = if poa > 0.0 { noise.between(0.995, 1.0) } else { 0.0 };

        index.push(ts);
        let row = [poa, poa2, t_amb, w_vel, pf, power.max(0.0)];
        for ((_, col), v) in columns.iter_mut().zip(row) {
            col.push(v);
        }
    }
    Measured { index, columns }
}

/// Measured data as one CSV per week.
fn write_measured_csv(dir: &Path, data: &Measured) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for (week, rows) in data.index.chunks(7 * 96).enumerate() {
        let path = dir.join(format!("week{}.csv", week + 1));
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        let mut header = vec!["Timestamp".to_string()];
        header.extend(data.columns.iter().map(|(n, _)| n.to_string()));
        writer.write_record(&header)?;

        let offset = week * 7 * 96;
        for (i, ts) in rows.iter().enumerate() {
            let mut record = vec![ts.format("%m/%d/%Y %H:%M").to_string()];
            record.extend(data.columns.iter().map(|(_, col)| format!("{:.3}", col[offset + i])));
            writer.write_record(&record)?;
        }
        writer.flush()?;
    }
    Ok(())
}

/// The same measured data as a single Parquet file.
fn write_measured_parquet(path: &Path, data: &Measured) -> Result<()> {
    let mut fields = vec![Field::new(
        "Timestamp",
        DataType::Timestamp(TimeUnit::Millisecond, None),
        false,
    )];
    fields.extend(
        data.columns
            .iter()
            .map(|(name, _)| Field::new(*name, DataType::Float64, true)),
    );
    let schema = Arc::new(Schema::new(fields));

    let millis: Vec<i64> = data
        .index
        .iter()
        .map(|ts| ts.and_utc().timestamp_millis())
        .collect();
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(TimestampMillisecondArray::from(millis))];
    for (_, col) in &data.columns {
        arrays.push(Arc::new(Float64Array::from(col.clone())));
    }
    let batch =
        RecordBatch::try_new(schema.clone(), arrays).context("Failed to create RecordBatch")?;

    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("Failed to create writer")?;
    writer.write(&batch).context("Failed to write batch")?;
    writer.close().context("Failed to close writer")?;
    Ok(())
}

/// An hourly PVsyst export for August 1990 with E_Grid in W.
fn write_pvsyst(path: &Path, noise: &mut Noise) -> Result<()> {
    let mut text = String::new();
    text.push_str("PVSYST V6.88\n\nSimulation variant: sample\n");
    for _ in 0..7 {
        text.push_str(";\n");
    }
    text.push_str("date,GlobInc,T Amb,WindVel,E_Grid,IL Pmin,IL Vmin,IL Pmax,IL Vmax,FShdBm\n");
    text.push_str(",W/m2,deg C,m/s,W,W,W,W,W,\n");

    let start = NaiveDate::from_ymd_opt(1990, 8, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    for hour in 0..31 * 24 {
        let ts = start + Duration::hours(hour);
        let (poa, t_amb, w_vel) = weather(ts, 0.97, noise);
        let mut e_grid = astm_power(poa, t_amb, w_vel).max(0.0) * 1000.0;
        let clipped = poa > 1000.0;
        let il_pmax = if clipped {
            let loss = e_grid - 5_800_000.0;
            e_grid -= loss.max(0.0);
            loss.max(0.0)
        } else {
            0.0
        };
        let shade = if clear_sky(ts) < 150.0 && poa > 0.0 { 0.8 } else { 1.0 };
        text.push_str(&format!(
            "{},{poa:.2},{t_amb:.2},{w_vel:.2},{e_grid:.1},0,0,{il_pmax:.1},0,{shade}\n",
            ts.format("%m/%d/%y %H:%M")
        ));
    }
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::init();
    let out: PathBuf = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sample_data"));
    std::fs::create_dir_all(&out).with_context(|| format!("creating {}", out.display()))?;

    let mut noise = Noise::seeded(42);
    let measured = generate_measured(&mut noise);
    write_measured_csv(&out.join("das"), &measured)?;
    write_measured_parquet(&out.join("das.parquet"), &measured)?;
    write_pvsyst(&out.join("pvsyst.csv"), &mut noise)?;

    write_json(
        &out.join("column_groups.json"),
        &json!({
            "irr_poa_ref_cell": ["met1_poa_ref_cell", "met2_poa_ref_cell"],
            "temp_amb": ["met1_amb_temp"],
            "wind": ["met1_wind_speed"],
            "pf_mtr": ["meter_power_factor"],
            "real_pwr_mtr": ["meter_real_power_kw"]
        }),
    )?;

    write_json(
        &out.join("captest.json"),
        &json!({
            "nameplate": NAMEPLATE_KW,
            "tolerance": "+/- 5",
            "report_pvalues": true,
            "measured": {
                "name": "das",
                "path": "das",
                "column_groups": "column_groups.json",
                "regression_cols": {
                    "power": "real_pwr_mtr",
                    "poa": "irr_poa_ref_cell",
                    "t_amb": "temp_amb",
                    "w_vel": "wind"
                },
                "aggregate": {"irr_poa_ref_cell": "mean"},
                "filters": [
                    {"filter": "missing"},
                    {"filter": "sensors", "perc_diff": {"irr_poa_ref_cell": 0.05}},
                    {"filter": "power_factor", "pf": 0.99},
                    {"filter": "irradiance", "low": 400, "high": 1100},
                    {"filter": "outliers", "contamination": 0.04}
                ],
                "rep_cond": {}
            },
            "simulated": {
                "name": "pvsyst",
                "path": "pvsyst.csv",
                "kind": "pvsyst",
                "egrid_unit_adj_factor": 1000,
                "filters": [
                    {"filter": "pvsyst"},
                    {"filter": "shade"},
                    {"filter": "irradiance", "low": 400, "high": 1100}
                ]
            }
        }),
    )?;

    println!(
        "Wrote {} measured rows (CSV + Parquet), 744 PVsyst hours and a config to {}",
        measured.index.len(),
        out.display()
    );
    Ok(())
}
