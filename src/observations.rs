//! Observation table loading and in-memory model.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use zip::ZipArchive;

/// Columns every observation file must carry, in no particular order.
pub const REQUIRED_COLUMNS: [&str; 7] = [
    "platform_code",
    "profile_no",
    "profile_timestamp",
    "longitude",
    "latitude",
    "pres",
    "observation_no",
];

const FLAG_COLUMN_SUFFIX: &str = "_qc";

/// Composite key identifying one instrument cast.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProfileKey {
    pub platform_code: String,
    pub profile_no: i64,
}

impl ProfileKey {
    pub fn new(platform_code: impl Into<String>, profile_no: i64) -> Self {
        Self {
            platform_code: platform_code.into(),
            profile_no,
        }
    }
}

/// One depth sample of one cast.
///
/// `flags` holds every `*_qc` column present on the row (absent cells are
/// simply not recorded); `values` holds every other extra numeric column
/// (absent cells are NaN).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    pub platform_code: String,
    pub profile_no: i64,
    pub profile_timestamp: DateTime<Utc>,
    pub longitude: f64,
    pub latitude: f64,
    pub pres: f64,
    pub observation_no: i64,
    pub flags: BTreeMap<String, i64>,
    pub values: BTreeMap<String, f64>,
}

impl ObservationRow {
    pub fn profile_key(&self) -> ProfileKey {
        ProfileKey::new(self.platform_code.clone(), self.profile_no)
    }

    pub fn flag(&self, column: &str) -> Option<i64> {
        self.flags.get(column).copied()
    }

    pub fn value(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied()
    }
}

/// Immutable in-memory observation table.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationTable {
    rows: Vec<ObservationRow>,
    flag_columns: BTreeSet<String>,
    value_columns: BTreeSet<String>,
}

impl ObservationTable {
    /// Build a table from rows, discovering the flag/variable column sets as
    /// the union over all rows.
    pub fn from_rows(rows: Vec<ObservationRow>) -> Self {
        let mut flag_columns = BTreeSet::new();
        let mut value_columns = BTreeSet::new();
        for row in &rows {
            flag_columns.extend(row.flags.keys().cloned());
            value_columns.extend(row.values.keys().cloned());
        }
        Self {
            rows,
            flag_columns,
            value_columns,
        }
    }

    pub fn rows(&self) -> &[ObservationRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_flag_column(&self, column: &str) -> bool {
        self.flag_columns.contains(column)
    }

    pub fn has_value_column(&self, column: &str) -> bool {
        self.value_columns.contains(column)
    }

    pub fn flag_columns(&self) -> impl Iterator<Item = &str> {
        self.flag_columns.iter().map(String::as_str)
    }

    pub fn value_columns(&self) -> impl Iterator<Item = &str> {
        self.value_columns.iter().map(String::as_str)
    }

    pub fn profile_count(&self) -> usize {
        let mut keys = BTreeSet::new();
        for row in &self.rows {
            keys.insert((row.platform_code.as_str(), row.profile_no));
        }
        keys.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationLoadReport {
    pub row_count: u64,
    pub profile_count: u64,
    pub flag_columns: Vec<String>,
    pub value_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationLoadResult {
    pub table: ObservationTable,
    pub report: ObservationLoadReport,
}

#[derive(Debug, Error)]
pub enum ObservationLoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("archive at {path} has no CSV or TSV entry")]
    MissingTabularEntry { path: PathBuf },
    #[error("observation file is missing required column {column}")]
    MissingColumn { column: &'static str },
    #[error("failed to parse field {field} value '{value}' at record {record}")]
    ParseField {
        field: String,
        value: String,
        record: u64,
    },
}

/// Load an observation table from a headered CSV or TSV file, or from the
/// first CSV/TSV entry of a zip archive.
pub fn load_observations(path: &Path) -> Result<ObservationLoadResult, ObservationLoadError> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    let (bytes, delimiter) = if extension == "zip" {
        read_zip_entry(path)?
    } else {
        (fs::read(path)?, delimiter_for_extension(&extension))
    };

    let table = parse_observations(&bytes, delimiter)?;
    let report = ObservationLoadReport {
        row_count: table.len() as u64,
        profile_count: table.profile_count() as u64,
        flag_columns: table.flag_columns().map(str::to_string).collect(),
        value_columns: table.value_columns().map(str::to_string).collect(),
    };

    info!(
        component = "observations",
        event = "observations.load.finish",
        path = %path.display(),
        row_count = report.row_count,
        profile_count = report.profile_count,
        flag_columns = ?report.flag_columns,
        value_columns = ?report.value_columns
    );

    Ok(ObservationLoadResult { table, report })
}

fn delimiter_for_extension(extension: &str) -> u8 {
    match extension {
        "tsv" | "txt" => b'\t',
        _ => b',',
    }
}

fn read_zip_entry(path: &Path) -> Result<(Vec<u8>, u8), ObservationLoadError> {
    let file = fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;

    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_ascii_lowercase();
        let delimiter = if name.ends_with(".csv") {
            b','
        } else if name.ends_with(".tsv") || name.ends_with(".txt") {
            b'\t'
        } else {
            continue;
        };

        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        return Ok((buf, delimiter));
    }

    Err(ObservationLoadError::MissingTabularEntry {
        path: path.to_path_buf(),
    })
}

fn parse_observations(
    bytes: &[u8],
    delimiter: u8,
) -> Result<ObservationTable, ObservationLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(Cursor::new(bytes));

    let headers = reader.headers()?.clone();
    let layout = ColumnLayout::from_headers(&headers)?;

    let mut rows = Vec::new();
    for (record_no, record) in reader.records().enumerate() {
        let record = record?;
        rows.push(parse_observation_record(
            &record,
            &layout,
            record_no as u64 + 1,
        )?);
    }

    Ok(ObservationTable::from_rows(rows))
}

struct ColumnLayout {
    platform_code: usize,
    profile_no: usize,
    profile_timestamp: usize,
    longitude: usize,
    latitude: usize,
    pres: usize,
    observation_no: usize,
    flags: Vec<(String, usize)>,
    values: Vec<(String, usize)>,
}

impl ColumnLayout {
    fn from_headers(headers: &StringRecord) -> Result<Self, ObservationLoadError> {
        let position = |column: &'static str| {
            headers
                .iter()
                .position(|header| header == column)
                .ok_or(ObservationLoadError::MissingColumn { column })
        };

        let mut flags = Vec::new();
        let mut values = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            if REQUIRED_COLUMNS.contains(&header) {
                continue;
            }
            if header.ends_with(FLAG_COLUMN_SUFFIX) {
                flags.push((header.to_string(), idx));
            } else {
                values.push((header.to_string(), idx));
            }
        }

        Ok(Self {
            platform_code: position("platform_code")?,
            profile_no: position("profile_no")?,
            profile_timestamp: position("profile_timestamp")?,
            longitude: position("longitude")?,
            latitude: position("latitude")?,
            pres: position("pres")?,
            observation_no: position("observation_no")?,
            flags,
            values,
        })
    }
}

fn parse_observation_record(
    record: &StringRecord,
    layout: &ColumnLayout,
    record_no: u64,
) -> Result<ObservationRow, ObservationLoadError> {
    let mut flags = BTreeMap::new();
    for (name, idx) in &layout.flags {
        let raw = record.get(*idx).unwrap_or_default().trim();
        if raw.is_empty() {
            continue;
        }
        flags.insert(name.clone(), parse_i64(raw, name, record_no)?);
    }

    let mut values = BTreeMap::new();
    for (name, idx) in &layout.values {
        let raw = record.get(*idx).unwrap_or_default().trim();
        let value = if raw.is_empty() {
            f64::NAN
        } else {
            parse_f64(raw, name, record_no)?
        };
        values.insert(name.clone(), value);
    }

    Ok(ObservationRow {
        platform_code: field(record, layout.platform_code).to_string(),
        profile_no: parse_i64(field(record, layout.profile_no), "profile_no", record_no)?,
        profile_timestamp: parse_timestamp(
            field(record, layout.profile_timestamp),
            record_no,
        )?,
        longitude: parse_f64(field(record, layout.longitude), "longitude", record_no)?,
        latitude: parse_f64(field(record, layout.latitude), "latitude", record_no)?,
        pres: parse_f64(field(record, layout.pres), "pres", record_no)?,
        observation_no: parse_i64(
            field(record, layout.observation_no),
            "observation_no",
            record_no,
        )?,
        flags,
        values,
    })
}

fn field<'a>(record: &'a StringRecord, idx: usize) -> &'a str {
    record.get(idx).unwrap_or_default().trim()
}

fn parse_i64(raw: &str, name: &str, record_no: u64) -> Result<i64, ObservationLoadError> {
    raw.parse::<i64>()
        .map_err(|_| ObservationLoadError::ParseField {
            field: name.to_string(),
            value: raw.to_string(),
            record: record_no,
        })
}

fn parse_f64(raw: &str, name: &str, record_no: u64) -> Result<f64, ObservationLoadError> {
    raw.parse::<f64>()
        .map_err(|_| ObservationLoadError::ParseField {
            field: name.to_string(),
            value: raw.to_string(),
            record: record_no,
        })
}

/// Externally computed per-profile summary statistics, keyed by profile.
///
/// The statistics themselves are produced outside this crate; this is just
/// the in-memory shape the feature extractor joins against.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileStatsTable {
    columns: Vec<String>,
    rows: HashMap<ProfileKey, Vec<f64>>,
}

#[derive(Debug, Error, PartialEq)]
#[error("profile statistics row for {platform_code}-{profile_no} has {actual} values, expected {expected}")]
pub struct StatsShapeError {
    pub platform_code: String,
    pub profile_no: i64,
    pub expected: usize,
    pub actual: usize,
}

impl ProfileStatsTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: ProfileKey, values: Vec<f64>) -> Result<(), StatsShapeError> {
        if values.len() != self.columns.len() {
            return Err(StatsShapeError {
                platform_code: key.platform_code,
                profile_no: key.profile_no,
                expected: self.columns.len(),
                actual: values.len(),
            });
        }
        self.rows.insert(key, values);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn get(&self, key: &ProfileKey) -> Option<&[f64]> {
        self.rows.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Load a profile statistics table from a headered CSV file: `platform_code`
/// and `profile_no` plus one numeric column per statistic.
pub fn load_profile_stats(path: &Path) -> Result<ProfileStatsTable, ObservationLoadError> {
    let bytes = fs::read(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(Cursor::new(bytes));

    let headers = reader.headers()?.clone();
    let platform_idx = headers
        .iter()
        .position(|header| header == "platform_code")
        .ok_or(ObservationLoadError::MissingColumn {
            column: "platform_code",
        })?;
    let profile_idx = headers
        .iter()
        .position(|header| header == "profile_no")
        .ok_or(ObservationLoadError::MissingColumn {
            column: "profile_no",
        })?;

    let stat_columns: Vec<(String, usize)> = headers
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != platform_idx && *idx != profile_idx)
        .map(|(idx, header)| (header.to_string(), idx))
        .collect();

    let mut table = ProfileStatsTable::new(
        stat_columns.iter().map(|(name, _)| name.clone()).collect(),
    );
    for (record_no, record) in reader.records().enumerate() {
        let record = record?;
        let record_no = record_no as u64 + 1;
        let key = ProfileKey::new(
            field(&record, platform_idx).to_string(),
            parse_i64(field(&record, profile_idx), "profile_no", record_no)?,
        );
        let mut values = Vec::with_capacity(stat_columns.len());
        for (name, idx) in &stat_columns {
            let raw = record.get(*idx).unwrap_or_default().trim();
            let value = if raw.is_empty() {
                f64::NAN
            } else {
                parse_f64(raw, name, record_no)?
            };
            values.push(value);
        }
        // Width always matches the header-derived column list.
        table.rows.insert(key, values);
    }

    Ok(table)
}

fn parse_timestamp(raw: &str, record_no: u64) -> Result<DateTime<Utc>, ObservationLoadError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(ObservationLoadError::ParseField {
        field: "profile_timestamp".to_string(),
        value: raw.to_string(),
        record: record_no,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_csv() -> &'static str {
        "platform_code,profile_no,profile_timestamp,longitude,latitude,pres,observation_no,temp,temp_qc\n\
         WMO100,1,2024-03-05T10:00:00,12.5,-30.0,5.0,1,14.2,1\n\
         WMO100,1,2024-03-05T10:00:00,12.5,-30.0,10.0,2,,4\n"
    }

    #[test]
    fn csv_parsing_discovers_flag_and_value_columns() {
        let table = parse_observations(sample_csv().as_bytes(), b',').unwrap();

        assert_eq!(table.len(), 2);
        assert!(table.has_flag_column("temp_qc"));
        assert!(table.has_value_column("temp"));
        assert!(!table.has_value_column("temp_qc"));
        assert_eq!(table.profile_count(), 1);
    }

    #[test]
    fn empty_value_cell_becomes_nan_and_empty_flag_is_absent() {
        let csv = "platform_code,profile_no,profile_timestamp,longitude,latitude,pres,observation_no,temp,temp_qc\n\
                   WMO100,1,2024-03-05T10:00:00,12.5,-30.0,5.0,1,,\n";
        let table = parse_observations(csv.as_bytes(), b',').unwrap();

        let row = &table.rows()[0];
        assert!(row.value("temp").unwrap().is_nan());
        assert_eq!(row.flag("temp_qc"), None);
    }

    #[test]
    fn missing_required_column_is_rejected() {
        let csv = "platform_code,profile_no,longitude,latitude,pres,observation_no\n";
        let err = parse_observations(csv.as_bytes(), b',').unwrap_err();
        assert!(matches!(
            err,
            ObservationLoadError::MissingColumn {
                column: "profile_timestamp"
            }
        ));
    }

    #[test]
    fn unparseable_field_names_field_and_value() {
        let csv = "platform_code,profile_no,profile_timestamp,longitude,latitude,pres,observation_no\n\
                   WMO100,abc,2024-03-05T10:00:00,12.5,-30.0,5.0,1\n";
        let err = parse_observations(csv.as_bytes(), b',').unwrap_err();
        match err {
            ObservationLoadError::ParseField { field, value, record } => {
                assert_eq!(field, "profile_no");
                assert_eq!(value, "abc");
                assert_eq!(record, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn timestamp_accepts_rfc3339_and_space_separated() {
        for raw in [
            "2024-03-05T10:00:00Z",
            "2024-03-05T10:00:00+00:00",
            "2024-03-05T10:00:00",
            "2024-03-05 10:00:00",
        ] {
            let parsed = parse_timestamp(raw, 1).unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap());
        }
        assert!(parse_timestamp("05/03/2024", 1).is_err());
    }

    #[test]
    fn tsv_delimiter_is_selected_by_extension() {
        assert_eq!(delimiter_for_extension("tsv"), b'\t');
        assert_eq!(delimiter_for_extension("txt"), b'\t');
        assert_eq!(delimiter_for_extension("csv"), b',');
    }
}
