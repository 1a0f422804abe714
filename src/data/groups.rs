use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::model::TimeSeriesFrame;

// ---------------------------------------------------------------------------
// ColumnGroups – group id → raw column names
// ---------------------------------------------------------------------------

/// Groups raw column names into logical sensor channels, e.g. every
/// plane-of-array reference cell under `irr_poa_ref_cell`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnGroups {
    groups: BTreeMap<String, Vec<String>>,
}

impl ColumnGroups {
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        ColumnGroups { groups }
    }

    /// Read a JSON object of `{"group id": ["column", ...], ...}`.
    pub fn from_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading column groups {}", path.display()))?;
        let groups: ColumnGroups =
            serde_json::from_str(&text).context("parsing column groups JSON")?;
        Ok(groups)
    }

    pub fn get(&self, group: &str) -> Option<&[String]> {
        self.groups.get(group).map(|cols| cols.as_slice())
    }

    pub fn contains(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn insert(&mut self, group: &str, columns: Vec<String>) {
        self.groups.insert(group.to_string(), columns);
    }

    /// The first group that lists `column`.
    pub fn group_of(&self, column: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, cols)| cols.iter().any(|c| c == column))
            .map(|(k, _)| k.as_str())
    }

    /// Remove columns from every group. Groups left empty are removed.
    pub fn drop_columns(&mut self, columns: &[&str]) {
        for cols in self.groups.values_mut() {
            cols.retain(|c| !columns.contains(&c.as_str()));
        }
        self.groups.retain(|_, cols| !cols.is_empty());
    }

    /// Drop references to columns the frame does not have, logging each.
    pub fn retain_present(&mut self, frame: &TimeSeriesFrame) {
        for (group, cols) in self.groups.iter_mut() {
            cols.retain(|c| {
                let present = frame.has_column(c);
                if !present {
                    log::warn!("column '{c}' of group '{group}' is not in the data");
                }
                present
            });
        }
        self.groups.retain(|_, cols| !cols.is_empty());
    }

    /// Group columns by matching their names against known sensor types.
    ///
    /// The group id joins the matched type, sub-type and irradiance sensor
    /// kind with `_`, e.g. `irr_poa_ref_cell`, `temp_amb`, `real_pwr_mtr`.
    /// Columns that match nothing land in `unassigned`.
    pub fn infer(frame: &TimeSeriesFrame) -> Self {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in frame.columns() {
            let values = frame.column(name).unwrap_or(&[]);
            let kind = classify(name, TYPE_DEFS);
            if let Some(def) = kind {
                check_bounds(name, values, def);
            }
            let parts: Vec<&str> = [
                kind.map(|d| d.key),
                classify(name, SUB_TYPE_DEFS).map(|d| d.key),
                classify(name, IRR_SENSOR_DEFS).map(|d| d.key),
            ]
            .into_iter()
            .flatten()
            .collect();

            let id = if kind.is_none() {
                "unassigned".to_string()
            } else {
                parts.join("_")
            };
            groups.entry(id).or_default().push(name.clone());
        }
        ColumnGroups { groups }
    }
}

// ---------------------------------------------------------------------------
// Column-name heuristics
// ---------------------------------------------------------------------------

struct TypeDef {
    key: &'static str,
    search: &'static [&'static str],
    bounds: Option<(f64, f64)>,
}

// Search strings must not repeat across entries of the same table; the first
// matching entry wins.
const TYPE_DEFS: &[TypeDef] = &[
    TypeDef {
        key: "irr",
        search: &[
            "irradiance", "irr", "plane of array", "poa", "ghi", "global", "glob", "w/m^2",
            "w/m2", "w/m", "w/",
        ],
        bounds: Some((-10.0, 1500.0)),
    },
    TypeDef {
        key: "temp",
        search: &[
            "temperature", "temp", "degrees", "deg", "ambient", "amb", "cell temperature",
            "tarray",
        ],
        bounds: Some((-49.0, 127.0)),
    },
    TypeDef {
        key: "wind",
        search: &["wind", "speed"],
        bounds: Some((0.0, 18.0)),
    },
    TypeDef {
        key: "pf",
        search: &["power factor", "factor", "pf"],
        bounds: Some((-1.0, 1.0)),
    },
    TypeDef {
        key: "op_state",
        search: &["operating state", "state", "op", "status"],
        bounds: Some((0.0, 10.0)),
    },
    TypeDef {
        key: "real_pwr",
        search: &["real power", "ac power", "e_grid", "kw"],
        bounds: Some((-1e6, 1e12)),
    },
    TypeDef {
        key: "shade",
        search: &["fshdbm", "shd", "shade"],
        bounds: Some((0.0, 1.0)),
    },
    TypeDef {
        key: "pvsyst_losses",
        search: &["il pmax", "il pmin", "il vmax", "il vmin", "il_pmax", "il_pmin", "il_vmax", "il_vmin"],
        bounds: None,
    },
];

const SUB_TYPE_DEFS: &[TypeDef] = &[
    TypeDef {
        key: "ghi",
        search: &["sun2", "global horizontal", "ghi", "global", "globhor"],
        bounds: None,
    },
    TypeDef {
        key: "poa",
        search: &["sun", "plane of array", "poa", "globinc"],
        bounds: None,
    },
    TypeDef {
        key: "amb",
        search: &["tempf", "ambient", "amb"],
        bounds: None,
    },
    TypeDef {
        key: "mod",
        search: &["temp1", "module", "mod", "tarray"],
        bounds: None,
    },
    TypeDef {
        key: "mtr",
        search: &["revenue meter", "rev meter", "billing meter", "meter"],
        bounds: None,
    },
    TypeDef {
        key: "inv",
        search: &["inverter", "inv"],
        bounds: None,
    },
];

const IRR_SENSOR_DEFS: &[TypeDef] = &[
    TypeDef {
        key: "ref_cell",
        search: &["reference cell", "reference", "ref", "referance", "pvel"],
        bounds: None,
    },
    TypeDef {
        key: "pyran",
        search: &["pyranometer", "pyran"],
        bounds: None,
    },
    TypeDef {
        key: "clear_sky",
        search: &["csky"],
        bounds: None,
    },
];

fn classify(name: &str, defs: &'static [TypeDef]) -> Option<&'static TypeDef> {
    let lower = name.to_lowercase();
    defs.iter()
        .find(|def| def.search.iter().any(|s| lower.contains(s)))
}

fn check_bounds(name: &str, values: &[f64], def: &TypeDef) {
    let Some((lo, hi)) = def.bounds else {
        return;
    };
    let (min, max) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(mn, mx), &v| (mn.min(v), mx.max(v)));
    if min < lo {
        log::warn!("{min} in {name} is below {lo} for {}", def.key);
    }
    if max > hi {
        log::warn!("{max} in {name} is above {hi} for {}", def.key);
    }
}
