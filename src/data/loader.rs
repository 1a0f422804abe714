use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use arrow::array::{Array, ArrayRef, Float64Array, StringArray, TimestampMillisecondArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, TimeUnit};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use super::csky::{self, ClearSkyConfig};
use super::groups::ColumnGroups;
use super::model::TimeSeriesFrame;
use crate::capdata::CapData;

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load one measured-data file into a frame. Dispatch by extension.
///
/// Supported formats:
/// * `.csv`     – timestamp in the first column, one or more header rows
/// * `.parquet` – timestamp (or date string) first column, numeric columns after
pub fn load_frame(path: &Path) -> Result<TimeSeriesFrame> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "csv" => file_reader(path),
        "parquet" | "pq" => load_parquet_frame(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
}

/// Options for [`load_data`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Name given to the returned dataset.
    pub name: String,
    /// JSON column-group file. Groups are inferred from column names when absent.
    pub column_groups: Option<PathBuf>,
    /// Extension of the files to read when loading a directory.
    pub extension: String,
    /// Drop rows whose timestamp repeats, keeping the first.
    pub drop_duplicates: bool,
    /// Place the data on a regular grid at the detected frequency.
    pub reindex: bool,
    /// Append modelled clear-sky `poa_mod_csky` and `ghi_mod_csky` columns.
    pub clear_sky: Option<ClearSkyConfig>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            name: "das".to_string(),
            column_groups: None,
            extension: "csv".to_string(),
            drop_duplicates: true,
            reindex: true,
            clear_sky: None,
        }
    }
}

/// Load measured data from a file or a directory of files into a [`CapData`].
pub fn load_data(path: impl Into<PathBuf>, opts: &LoadOptions) -> Result<CapData> {
    let mut loader = DataLoader::new(path);
    loader.extension = opts.extension.clone();
    let mut data = loader.load()?;

    if opts.drop_duplicates {
        let removed = data.drop_duplicate_index();
        if removed > 0 {
            log::warn!("dropped {removed} rows with duplicate timestamps");
        }
    }

    if opts.reindex {
        match loader.common_freq.or_else(|| data.frequency()) {
            Some(freq) => {
                let before = data.len();
                data = data.reindex(freq)?;
                if data.len() != before {
                    log::info!("reindexed at {freq}: {before} rows -> {} rows", data.len());
                }
            }
            None => log::warn!("could not detect a frequency; data left as loaded"),
        }
    }

    if let Some(cfg) = &opts.clear_sky {
        csky::append_csky(&mut data, cfg).context("modelling clear-sky irradiance")?;
    }

    let column_groups = match &opts.column_groups {
        Some(groups_path) => {
            let mut groups = ColumnGroups::from_json(groups_path)?;
            groups.retain_present(&data);
            if opts.clear_sky.is_some() {
                csky::add_csky_groups(&mut groups);
            }
            groups
        }
        None => ColumnGroups::infer(&data),
    };

    log::info!(
        "Loaded '{}': {} rows, {} columns, {} column groups",
        opts.name,
        data.len(),
        data.columns().len(),
        column_groups.len()
    );
    Ok(CapData::new(&opts.name, data, column_groups))
}

// ---------------------------------------------------------------------------
// DataLoader – one file or every matching file in a directory
// ---------------------------------------------------------------------------

/// Loads and joins measured-data files.
#[derive(Debug, Clone)]
pub struct DataLoader {
    /// File or directory to load.
    pub path: PathBuf,
    /// Extension (without dot) matched when `path` is a directory.
    pub extension: String,
    /// Files to read. Filled from the directory when left empty.
    pub files_to_load: Vec<PathBuf>,
    /// Loaded frames keyed by file stem, in load order.
    pub loaded_files: Vec<(String, TimeSeriesFrame)>,
    /// Most common frequency across the loaded files.
    pub common_freq: Option<Duration>,
}

impl Default for DataLoader {
    fn default() -> Self {
        DataLoader::new("./data/")
    }
}

impl DataLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DataLoader {
            path: path.into(),
            extension: "csv".to_string(),
            files_to_load: Vec::new(),
            loaded_files: Vec::new(),
            common_freq: None,
        }
    }

    /// Collect the files in `path` with the configured extension, sorted.
    pub fn set_files_to_load(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.path)
            .with_context(|| format!("reading directory {}", self.path.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.context("reading directory entry")?.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension));
            if matches && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        if files.is_empty() {
            log::warn!(
                "No files with {} extension were found in the directory: {}",
                self.extension,
                self.path.display()
            );
        }
        self.files_to_load = files;
        Ok(())
    }

    /// Load every file and join them into one frame.
    pub fn load(&mut self) -> Result<TimeSeriesFrame> {
        if self.path.is_file() {
            let frame = load_frame(&self.path)?;
            log::info!("Read: {}", self.path.display());
            self.common_freq = frame.frequency();
            self.loaded_files = vec![(file_stem(&self.path), frame.clone())];
            return Ok(frame);
        }

        if self.files_to_load.is_empty() {
            self.set_files_to_load()?;
        }
        if self.files_to_load.is_empty() {
            bail!("nothing to load in {}", self.path.display());
        }

        self.loaded_files.clear();
        for path in &self.files_to_load {
            let frame = load_frame(path).with_context(|| format!("loading {}", path.display()))?;
            log::info!("Read: {}", path.display());
            self.loaded_files.push((file_stem(path), frame));
        }

        let freqs = self.file_frequencies();
        self.common_freq = most_common(&freqs);
        if freqs.iter().flatten().collect::<HashSet<_>>().len() > 1 {
            log::warn!(
                "files have different frequencies; using the most common: {:?}",
                self.common_freq
            );
        }
        Ok(self.join_files())
    }

    /// Frequency of each loaded file, in load order.
    pub fn file_frequencies(&self) -> Vec<Option<Duration>> {
        self.loaded_files
            .iter()
            .map(|(_, frame)| frame.frequency())
            .collect()
    }

    pub fn loaded_file(&self, stem: &str) -> Option<&TimeSeriesFrame> {
        self.loaded_files
            .iter()
            .find(|(name, _)| name == stem)
            .map(|(_, frame)| frame)
    }

    /// Pairs of loaded files that share a column and a timestamp.
    pub fn overlapping_files(&self) -> Vec<(&str, &str)> {
        let mut pairs = Vec::new();
        for (i, (name_a, a)) in self.loaded_files.iter().enumerate() {
            let stamps: HashSet<&NaiveDateTime> = a.index().iter().collect();
            for (name_b, b) in &self.loaded_files[i + 1..] {
                let shares_column = a.columns().iter().any(|c| b.has_column(c));
                if shares_column && b.index().iter().any(|t| stamps.contains(t)) {
                    pairs.push((name_a.as_str(), name_b.as_str()));
                }
            }
        }
        pairs
    }

    /// Stack the loaded frames. Warns when two files share a column and a
    /// timestamp.
    pub fn join_files(&self) -> TimeSeriesFrame {
        for (name_a, name_b) in self.overlapping_files() {
            log::warn!("Some columns contain overlapping indices ({name_a}, {name_b}).");
        }
        let frames: Vec<TimeSeriesFrame> =
            self.loaded_files.iter().map(|(_, f)| f.clone()).collect();
        TimeSeriesFrame::concat(&frames)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string()
}

/// Most common value; ties go to the shorter duration.
fn most_common(freqs: &[Option<Duration>]) -> Option<Duration> {
    let mut counts: BTreeMap<Duration, usize> = BTreeMap::new();
    for freq in freqs.iter().flatten() {
        *counts.entry(*freq).or_default() += 1;
    }
    let max = counts.values().copied().max()?;
    counts
        .into_iter()
        .find(|(_, n)| *n == max)
        .map(|(f, _)| f)
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// Read a measured-data CSV.
///
/// Rows before the first row whose first cell is a timestamp are header
/// rows; multi-row headers are joined per column with `_`. Blank rows are
/// skipped and non-numeric cells become `NaN`.
pub fn file_reader(path: &Path) -> Result<TimeSeriesFrame> {
    let text = read_text(path)?;
    let records = read_records(&text, b',')?;

    let first_data = records
        .iter()
        .position(|rec| rec.first().and_then(|c| parse_timestamp(c)).is_some())
        .with_context(|| format!("{}: no timestamp found in the first column", path.display()))?;

    let header_rows: Vec<&Vec<String>> = records[..first_data].iter().collect();
    let width = records.iter().map(|r| r.len()).max().unwrap_or(0);
    let names = dedupe(flatten_headers(&header_rows, width));

    let mut index = Vec::new();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); names.len()];
    for (row_no, rec) in records[first_data..].iter().enumerate() {
        let Some(ts) = rec.first().and_then(|c| parse_timestamp(c)) else {
            log::debug!("{}: skipping row {row_no} without a timestamp", path.display());
            continue;
        };
        index.push(ts);
        for (j, col) in columns.iter_mut().enumerate() {
            col.push(rec.get(j + 1).map_or(f64::NAN, |c| parse_number(c)));
        }
    }

    let mut frame = TimeSeriesFrame::from_columns(index, names.into_iter().zip(columns).collect())?;
    frame.drop_empty();
    Ok(frame)
}

/// Join header levels per column with `_`, skipping empty parts. Column 0
/// (the timestamp) is not included.
pub fn flatten_headers(header_rows: &[&Vec<String>], width: usize) -> Vec<String> {
    (1..width)
        .map(|j| {
            let parts: Vec<&str> = header_rows
                .iter()
                .filter_map(|row| row.get(j))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                format!("column_{j}")
            } else {
                parts.join("_")
            }
        })
        .collect()
}

fn dedupe(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let mut candidate = name.clone();
            let mut n = 1;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{name}.{n}");
                n += 1;
            }
            candidate
        })
        .collect()
}

/// Read a file as UTF-8, falling back to Latin-1.
fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let text = match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => {
            log::debug!("{} is not UTF-8; decoding as Latin-1", path.display());
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

/// All non-blank records of a delimited text, cells trimmed.
fn read_records(text: &str, delimiter: u8) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        let cells: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
        if cells.iter().all(|c| c.is_empty()) {
            continue;
        }
        records.push(cells);
    }
    Ok(records)
}

fn parse_number(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(f64::NAN)
}

// Two-digit-year formats come before `%Y` ones, and month-first before
// year-first: `%Y` also accepts "8" or "22".
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%y %H:%M:%S",
    "%m/%d/%y %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y"];

/// Parse a timestamp in one of the common logger export formats.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

// ---------------------------------------------------------------------------
// PVsyst loader
// ---------------------------------------------------------------------------

/// Options for [`load_pvsyst`].
#[derive(Debug, Clone)]
pub struct PvsystOptions {
    /// Name given to the returned dataset.
    pub name: String,
    /// Preamble lines before the column-name row.
    pub skip_rows: usize,
    pub delimiter: u8,
    /// `E_Grid` is divided by this factor, e.g. 1000 for W → kW.
    pub egrid_unit_adj_factor: Option<f64>,
    /// Map the standard PVsyst columns to the regression variables.
    pub set_regression_columns: bool,
}

impl Default for PvsystOptions {
    fn default() -> Self {
        Self {
            name: "pvsyst".to_string(),
            skip_rows: 10,
            delimiter: b',',
            egrid_unit_adj_factor: None,
            set_regression_columns: true,
        }
    }
}

const PVSYST_MDY: &[&str] = &["%m/%d/%y %H:%M", "%m/%d/%Y %H:%M"];
const PVSYST_DMY: &[&str] = &["%d/%m/%y %H:%M", "%d/%m/%Y %H:%M"];

/// Load a PVsyst hourly results export.
///
/// Layout: `skip_rows` preamble lines, a column-name row, a units row, then
/// data with a `date` column.
pub fn load_pvsyst(path: &Path, opts: &PvsystOptions) -> Result<CapData> {
    let text = read_text(path)?;
    let body: String = text
        .lines()
        .skip(opts.skip_rows)
        .collect::<Vec<_>>()
        .join("\n");
    let records = read_records(&body, opts.delimiter)?;
    if records.len() < 2 {
        bail!("{}: missing PVsyst name and unit rows", path.display());
    }

    let names: Vec<String> = records[0].iter().map(|n| n.trim().to_string()).collect();
    let date_idx = names
        .iter()
        .position(|n| n.eq_ignore_ascii_case("date"))
        .with_context(|| format!("{}: PVsyst file missing 'date' column", path.display()))?;
    let rows = &records[2..];

    let dates: Vec<&str> = rows
        .iter()
        .map(|r| r.get(date_idx).map_or("", |s| s.as_str()))
        .collect();
    let index = match parse_all(&dates, PVSYST_MDY) {
        Some(index) => index,
        None => {
            log::warn!("Dates are not in month/day/year format. Trying day/month/year format.");
            parse_all(&dates, PVSYST_DMY)
                .with_context(|| format!("{}: unrecognised PVsyst date format", path.display()))?
        }
    };

    let columns: Vec<(String, Vec<f64>)> = names
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != date_idx)
        .map(|(j, name)| {
            let values = rows
                .iter()
                .map(|r| r.get(j).map_or(f64::NAN, |c| parse_number(c)))
                .collect();
            (name.clone(), values)
        })
        .collect();
    let mut data = TimeSeriesFrame::from_columns(index, columns)?;
    data.rename_column("T Amb", "T_Amb");

    if let Some(factor) = opts.egrid_unit_adj_factor {
        data.map_column("E_Grid", |v| v / factor)
            .context("adjusting E_Grid units")?;
    }

    let groups = ColumnGroups::infer(&data);
    log::info!(
        "Loaded PVsyst '{}': {} rows, {} columns",
        opts.name,
        data.len(),
        data.columns().len()
    );
    let mut cd = CapData::new(&opts.name, data, groups);
    if opts.set_regression_columns {
        cd.set_regression_cols("E_Grid", "GlobInc", "T_Amb", "WindVel");
    }
    Ok(cd)
}

fn parse_all(values: &[&str], formats: &[&str]) -> Option<Vec<NaiveDateTime>> {
    values
        .iter()
        .map(|v| {
            formats
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(v.trim(), fmt).ok())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file of measured data.
///
/// Expected schema:
/// - first column: Arrow timestamp / date, or a string timestamp
/// - every other column: anything castable to Float64 (nulls become `NaN`)
pub fn load_parquet_frame(path: &Path) -> Result<TimeSeriesFrame> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut index: Vec<NaiveDateTime> = Vec::new();
    let mut names: Vec<String> = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();
        if batch.num_columns() == 0 {
            bail!("Parquet file has no columns");
        }
        if names.is_empty() {
            names = schema.fields().iter().skip(1).map(|f| f.name().clone()).collect();
            columns = vec![Vec::new(); names.len()];
        }

        index.extend(extract_timestamps(batch.column(0))?);
        for (j, values) in columns.iter_mut().enumerate() {
            let col = batch.column(j + 1);
            values.extend(
                extract_f64(col).with_context(|| format!("column '{}'", names[j]))?,
            );
        }
    }

    let frame = TimeSeriesFrame::from_columns(index, names.into_iter().zip(columns).collect())?;
    Ok(frame)
}

// -- Parquet / Arrow helpers --

fn extract_timestamps(col: &ArrayRef) -> Result<Vec<NaiveDateTime>> {
    match col.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 => {
            let strings = cast(col.as_ref(), &DataType::Utf8).context("casting timestamps")?;
            let strings = strings
                .as_any()
                .downcast_ref::<StringArray>()
                .context("expected StringArray")?;
            (0..strings.len())
                .map(|i| {
                    let s = if strings.is_null(i) { "" } else { strings.value(i) };
                    parse_timestamp(s).with_context(|| format!("row {i}: bad timestamp '{s}'"))
                })
                .collect()
        }
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
            let millis = cast(
                col.as_ref(),
                &DataType::Timestamp(TimeUnit::Millisecond, None),
            )
            .context("casting timestamps")?;
            let millis = millis
                .as_any()
                .downcast_ref::<TimestampMillisecondArray>()
                .context("expected TimestampMillisecondArray")?;
            (0..millis.len())
                .map(|i| {
                    if millis.is_null(i) {
                        bail!("row {i}: null timestamp");
                    }
                    DateTime::from_timestamp_millis(millis.value(i))
                        .map(|dt| dt.naive_utc())
                        .with_context(|| format!("row {i}: timestamp out of range"))
                })
                .collect()
        }
        other => bail!("Expected a timestamp or string first column, got {other:?}"),
    }
}

fn extract_f64(col: &ArrayRef) -> Result<Vec<f64>> {
    let floats = cast(col.as_ref(), &DataType::Float64).context("casting to Float64")?;
    let floats = floats
        .as_any()
        .downcast_ref::<Float64Array>()
        .context("expected Float64Array")?;
    Ok(floats
        .iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    fn minute_rows(day: u32, n: usize) -> String {
        let start = NaiveDate::from_ymd_opt(2022, 8, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (0..n)
            .map(|i| {
                let ts = start + Duration::minutes(i as i64);
                format!("{},{},{}\n", ts.format("%Y-%m-%d %H:%M:%S"), i, i + 20)
            })
            .collect()
    }

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn well_formatted_file() {
        let dir = tempfile::tempdir().unwrap();
        let csv = format!(",met1_poa1,met1_poa2\n{}", minute_rows(1, 20));
        let frame = file_reader(&write(dir.path(), "simple.csv", &csv)).unwrap();
        assert_eq!(frame.len(), 20);
        assert_eq!(frame.columns(), &["met1_poa1", "met1_poa2"]);
        assert_eq!(frame.column("met1_poa2").unwrap()[3], 23.0);
    }

    #[test]
    fn double_headers_are_joined() {
        let dir = tempfile::tempdir().unwrap();
        let csv = format!(",met1,met2\n,poa,poa\n{}", minute_rows(1, 20));
        let frame = file_reader(&write(dir.path(), "double.csv", &csv)).unwrap();
        assert_eq!(frame.columns()[0], "met1_poa");
        assert_eq!(frame.columns()[1], "met2_poa");
    }

    #[test]
    fn blank_rows_after_headers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let csv = format!(",met1,met2\n,poa,poa\n,,\n{}", minute_rows(1, 20));
        let frame = file_reader(&write(dir.path(), "blank.csv", &csv)).unwrap();
        assert_eq!(frame.columns()[0], "met1_poa");
        assert_eq!(frame.len(), 20);
    }

    #[test]
    fn non_numeric_cells_become_nan() {
        let dir = tempfile::tempdir().unwrap();
        let csv = "ts,a,b,c\n2022-08-01 00:00,1,x,5\n2022-08-01 00:01,bad,,6\n2022-08-01 00:02,3,y,7\n";
        let frame = file_reader(&write(dir.path(), "nan.csv", csv)).unwrap();
        // column b holds no numbers at all and is dropped
        assert_eq!(frame.columns(), &["a", "c"]);
        assert_eq!(frame.len(), 3);
        assert!(frame.column("a").unwrap()[1].is_nan());
    }

    #[test]
    fn latin1_headers_decode() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = b",Temp \xb0C\n".to_vec();
        bytes.extend_from_slice(b"2022-08-01 00:00,25\n");
        let path = dir.path().join("latin1.csv");
        std::fs::write(&path, bytes).unwrap();
        let frame = file_reader(&path).unwrap();
        assert_eq!(frame.columns()[0], "Temp \u{b0}C");
    }

    #[test]
    fn timestamps_in_common_formats() {
        let expected = NaiveDate::from_ymd_opt(2022, 8, 1)
            .unwrap()
            .and_hms_opt(13, 5, 0)
            .unwrap();
        for s in ["2022-08-01 13:05:00", "2022-08-01T13:05", "8/1/22 13:05", "08/01/2022 13:05"] {
            assert_eq!(parse_timestamp(s), Some(expected), "{s}");
        }
        assert_eq!(parse_timestamp("poa"), None);
    }

    #[test]
    fn files_to_load_filters_extension() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.csv", "b.parquet", "c.csv"] {
            write(dir.path(), name, "");
        }
        let mut dl = DataLoader::new(dir.path());
        dl.set_files_to_load().unwrap();
        assert_eq!(
            dl.files_to_load,
            vec![dir.path().join("a.csv"), dir.path().join("c.csv")]
        );
    }

    #[test]
    fn default_path() {
        assert_eq!(DataLoader::default().path, PathBuf::from("./data/"));
    }

    #[test]
    fn load_specific_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (1..=3)
            .map(|d| {
                let csv = format!(",met1_poa1,met1_poa2\n{}", minute_rows(d, 20));
                write(dir.path(), &format!("file_{d}.csv"), &csv)
            })
            .collect();
        let mut dl = DataLoader::new(dir.path());
        dl.files_to_load = vec![paths[0].clone(), paths[2].clone()];
        let data = dl.load().unwrap();
        assert_eq!(data.len(), 40);
        assert!(dl.loaded_file("file_1").is_some());
        assert!(dl.loaded_file("file_2").is_none());
        assert_eq!(dl.common_freq, Some(Duration::minutes(1)));
    }

    #[test]
    fn overlapping_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let header = ",met1_poa1,met1_poa2\n";
        write(dir.path(), "a.csv", &format!("{header}{}", minute_rows(1, 20)));
        // b repeats the last ten minutes of a
        let b: String = minute_rows(1, 30).lines().skip(10).map(|l| format!("{l}\n")).collect();
        write(dir.path(), "b.csv", &format!("{header}{b}"));
        write(dir.path(), "c.csv", &format!("{header}{}", minute_rows(2, 20)));
        // d shares timestamps with c but no column
        let d: String = (0..5)
            .map(|i| format!("2022-08-02 00:0{i}:00,{i}\n"))
            .collect();
        write(dir.path(), "d.csv", &format!(",other\n{d}"));

        let mut dl = DataLoader::new(dir.path());
        dl.load().unwrap();
        assert_eq!(dl.overlapping_files(), vec![("a", "b")]);
        assert_eq!(dl.loaded_file("b").unwrap().len(), 20);
    }

    #[test]
    fn most_common_frequency_wins() {
        let f = [
            Some(Duration::minutes(60)),
            Some(Duration::minutes(5)),
            Some(Duration::minutes(60)),
        ];
        assert_eq!(most_common(&f), Some(Duration::minutes(60)));
    }

    #[test]
    fn load_directory_reindexes_gaps() {
        let dir = tempfile::tempdir().unwrap();
        for d in 1..=3 {
            let csv = format!(",met1_poa1,met1_poa2\n{}", minute_rows(d, 20));
            write(dir.path(), &format!("file_{d}.csv"), &csv);
        }
        let cd = load_data(dir.path(), &LoadOptions::default()).unwrap();
        // 8/1 00:00 through 8/3 00:19 at one minute
        assert_eq!(cd.data().len(), 2 * 1440 + 20);
        assert_eq!(cd.data().columns().len(), 2);
    }

    fn pvsyst_text(date_fmt: &str, first_day: u32) -> String {
        let mut text = String::new();
        for i in 0..10 {
            text.push_str(&format!("PVSYST preamble line {i}\n"));
        }
        text.push_str("date,GlobInc,T Amb,WindVel,E_Grid\n");
        text.push_str(",W/m2,deg C,m/s,W\n");
        let start = NaiveDate::from_ymd_opt(1990, 1, first_day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        for h in 0..48 {
            let ts = start + Duration::hours(h);
            let e_grid = if h == 12 { 5_469_083.0 } else { 1000.0 * h as f64 };
            text.push_str(&format!(
                "{},{},{},{},{}\n",
                ts.format(date_fmt),
                10.0 * h as f64,
                20.0,
                2.0,
                e_grid
            ));
        }
        text
    }

    #[test]
    fn pvsyst_month_day_year() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "pvsyst.csv", &pvsyst_text("%m/%d/%y %H:%M", 1));
        let cd = load_pvsyst(&path, &PvsystOptions::default()).unwrap();
        let data = cd.data();
        assert_eq!(data.len(), 48);
        assert!(data.has_column("T_Amb"));
        assert_eq!(data.column("E_Grid").unwrap()[12], 5_469_083.0);
        assert_eq!(cd.regression_cols.get("power").map(String::as_str), Some("E_Grid"));
        assert_eq!(cd.regression_cols.get("w_vel").map(String::as_str), Some("WindVel"));
    }

    #[test]
    fn pvsyst_day_month_year_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "pvsyst.csv", &pvsyst_text("%d/%m/%y %H:%M", 12));
        let cd = load_pvsyst(&path, &PvsystOptions::default()).unwrap();
        // "12/01/90" reads as month/day too; "13/01/90" forces the fallback
        let index = cd.data().index();
        assert_eq!(index[0].date(), NaiveDate::from_ymd_opt(1990, 1, 12).unwrap());
        assert_eq!(index[24].date(), NaiveDate::from_ymd_opt(1990, 1, 13).unwrap());
    }

    #[test]
    fn pvsyst_egrid_scaling_and_no_regression_cols() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "pvsyst.csv", &pvsyst_text("%m/%d/%y %H:%M", 1));
        let opts = PvsystOptions {
            egrid_unit_adj_factor: Some(1000.0),
            set_regression_columns: false,
            ..PvsystOptions::default()
        };
        let cd = load_pvsyst(&path, &opts).unwrap();
        assert_eq!(cd.data().column("E_Grid").unwrap()[12], 5_469.083);
        assert!(cd.regression_cols.is_empty());
    }

    #[test]
    fn pvsyst_semicolon_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let text = pvsyst_text("%m/%d/%y %H:%M", 1).replace(',', ";");
        let path = write(dir.path(), "pvsyst.csv", &text);
        let opts = PvsystOptions {
            delimiter: b';',
            ..PvsystOptions::default()
        };
        let cd = load_pvsyst(&path, &opts).unwrap();
        assert_eq!(cd.data().columns(), &["GlobInc", "T_Amb", "WindVel", "E_Grid"]);
        assert_eq!(cd.data().column("GlobInc").unwrap()[3], 30.0);
    }

    #[test]
    fn clear_sky_columns_join_json_groups() {
        use crate::data::csky::{ClearSkyConfig, Location, System, TimeZoneSpec, GHI_CSKY, POA_CSKY};

        let dir = tempfile::tempdir().unwrap();
        let csv = format!(",met1_poa1,met1_poa2\n{}", minute_rows(1, 20));
        let data = write(dir.path(), "meas.csv", &csv);
        let groups = write(dir.path(), "groups.json", r#"{"irr_poa": ["met1_poa1", "met1_poa2"]}"#);
        let opts = LoadOptions {
            column_groups: Some(groups),
            clear_sky: Some(ClearSkyConfig {
                loc: Location {
                    latitude: 35.0,
                    longitude: -106.0,
                    altitude: 1500.0,
                    tz: TimeZoneSpec::Hours(-7.0),
                },
                sys: System::Fixed {
                    surface_tilt: 25.0,
                    surface_azimuth: 180.0,
                    albedo: 0.2,
                },
            }),
            ..LoadOptions::default()
        };
        let cd = load_data(&data, &opts).unwrap();
        // local midnight: no sun
        assert_eq!(cd.data().column(POA_CSKY).unwrap()[0], 0.0);
        assert_eq!(cd.data().column(GHI_CSKY).unwrap()[19], 0.0);
        assert_eq!(cd.column_groups.get("irr_poa_clear_sky").unwrap(), &[POA_CSKY]);
        assert_eq!(cd.column_groups.get("irr_poa").unwrap().len(), 2);
    }

    #[test]
    fn parquet_frame_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meas.parquet");
        let schema = Arc::new(Schema::new(vec![
            Field::new("timestamp", DataType::Timestamp(TimeUnit::Millisecond, None), false),
            Field::new("poa", DataType::Float64, true),
            Field::new("count", DataType::Int64, false),
        ]));
        let base = 1_659_312_000_000_i64; // 2022-08-01T00:00:00Z
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(TimestampMillisecondArray::from(vec![base, base + 60_000])),
                Arc::new(Float64Array::from(vec![Some(500.0), None])),
                Arc::new(Int64Array::from(vec![1, 2])),
            ],
        )
        .unwrap();
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let frame = load_frame(&path).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.columns(), &["poa", "count"]);
        assert!(frame.column("poa").unwrap()[1].is_nan());
        assert_eq!(frame.column("count").unwrap()[1], 2.0);
        assert_eq!(frame.index()[1] - frame.index()[0], Duration::minutes(1));
    }
}
