//! CSV export of pipeline tables, with an explicit empty-table guard.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::features::FeatureTable;
use crate::profiles::SelectedProfile;
use crate::rows::SelectedRow;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("refusing to write empty table: {table}")]
    EmptyTable { table: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid output path: {path}")]
    InvalidPath { path: PathBuf },
}

/// Write `selected_profiles` as CSV.
pub fn write_selected_profiles(
    path: &Path,
    profiles: &[SelectedProfile],
) -> Result<(), ExportError> {
    guard_non_empty("selected_profiles", profiles.len())?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "platform_code",
        "profile_no",
        "profile_timestamp",
        "longitude",
        "latitude",
        "profile_id",
        "neg_profile_id",
        "label",
    ])?;
    for profile in profiles {
        writer.write_record([
            profile.platform_code.clone(),
            profile.profile_no.to_string(),
            profile.profile_timestamp.to_rfc3339(),
            format_float(profile.longitude),
            format_float(profile.latitude),
            profile.profile_id.to_string(),
            profile.neg_profile_id.to_string(),
            profile.label.to_string(),
        ])?;
    }

    finish(path, writer, "selected_profiles", profiles.len())
}

/// Write one target's `selected_rows` as CSV.
pub fn write_selected_rows(
    path: &Path,
    target: &str,
    rows: &[SelectedRow],
) -> Result<(), ExportError> {
    guard_non_empty(&format!("selected_rows[{target}]"), rows.len())?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "row_id",
        "profile_id",
        "platform_code",
        "profile_no",
        "observation_no",
        "pres",
        "flag",
        "label",
        "pair_id",
    ])?;
    for row in rows {
        writer.write_record([
            row.row_id.to_string(),
            row.profile_id.to_string(),
            row.platform_code.clone(),
            row.profile_no.to_string(),
            row.observation_no.to_string(),
            format_float(row.pres),
            row.flag.to_string(),
            row.label.to_string(),
            row.pair_id.clone(),
        ])?;
    }

    finish(path, writer, "selected_rows", rows.len())
}

/// Write one target's feature table as CSV, plus a JSON schema sidecar at
/// `<path>.schema.json` carrying version and fingerprint for downstream
/// compatibility checks.
pub fn write_feature_table(path: &Path, table: &FeatureTable) -> Result<(), ExportError> {
    guard_non_empty(
        &format!("target_features[{}]", table.schema.target),
        table.rows.len(),
    )?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec![
        "row_id".to_string(),
        "label".to_string(),
        "profile_id".to_string(),
        "pair_id".to_string(),
    ];
    header.extend(table.schema.columns.iter().map(|column| column.name.clone()));
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = vec![
            row.row_id.to_string(),
            row.label.to_string(),
            row.profile_id.to_string(),
            row.pair_id.clone(),
        ];
        record.extend(row.values.iter().map(|value| format_float(*value)));
        writer.write_record(&record)?;
    }

    finish(path, writer, "target_features", table.rows.len())?;

    let sidecar = sidecar_path(path)?;
    let schema_json = serde_json::to_vec_pretty(&table.schema)?;
    write_atomic(&sidecar, &schema_json)?;
    Ok(())
}

fn guard_non_empty(table: &str, rows: usize) -> Result<(), ExportError> {
    if rows == 0 {
        return Err(ExportError::EmptyTable {
            table: table.to_string(),
        });
    }
    Ok(())
}

fn format_float(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

fn finish(
    path: &Path,
    writer: csv::Writer<Vec<u8>>,
    table: &str,
    rows: usize,
) -> Result<(), ExportError> {
    let bytes = writer
        .into_inner()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
    write_atomic(path, &bytes)?;

    info!(
        component = "export",
        event = "export.table.written",
        table = table,
        path = %path.display(),
        rows = rows,
        bytes = bytes.len()
    );
    Ok(())
}

fn sidecar_path(path: &Path) -> Result<PathBuf, ExportError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ExportError::InvalidPath {
            path: path.to_path_buf(),
        })?;
    Ok(path.with_file_name(format!("{file_name}.schema.json")))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ExportError::InvalidPath {
            path: path.to_path_buf(),
        })?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
