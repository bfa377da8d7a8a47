//! Per-target feature extraction: schema building and generator dispatch.

use std::collections::HashMap;
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::config::{Bounds, FeatureSpec};
use crate::observations::{ObservationTable, ProfileKey, ProfileStatsTable};
use crate::profiles::{day_of_year, SelectedProfile};
use crate::rows::SelectedRow;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub target: String,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

/// One output row of a `target_features[target]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub row_id: i64,
    pub label: u8,
    pub profile_id: i64,
    pub pair_id: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
}

/// Read-only views handed to the feature generators.
#[derive(Debug, Clone, Copy)]
pub struct FeatureInputs<'a> {
    pub rows: &'a [SelectedRow],
    pub profiles: &'a [SelectedProfile],
    pub filtered: Option<&'a ObservationTable>,
    pub profile_stats: Option<&'a ProfileStatsTable>,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("flank window features require the filtered observation table")]
    MissingFilteredInput,
    #[error("profile statistics features require the profile statistics table")]
    MissingStatsInput,
    #[error("unknown profile statistics column: {column}")]
    UnknownStatsColumn { column: String },
    #[error("variable {variable} is missing from the filtered observation table")]
    MissingVariable { variable: String },
    #[error("row {row_id} references profile {platform_code}-{profile_no} absent from selected_profiles")]
    UnknownProfile {
        row_id: i64,
        platform_code: String,
        profile_no: i64,
    },
    #[error("feature schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("feature schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// Cyclic day-of-year encoding into [0, 1], continuous across the year
/// boundary.
pub fn encode_day_of_year(day: u32) -> f64 {
    ((day as f64 * 2.0 * PI / 365.0).sin() + 1.0) / 2.0
}

/// Column layout (and fingerprint) implied by a feature spec list. Building
/// the schema never touches data, so train and classify runs can compare
/// fingerprints before extracting anything.
pub fn build_feature_schema(target: &str, specs: &[FeatureSpec]) -> FeatureSchema {
    let mut columns = Vec::new();
    for spec in specs {
        match spec {
            FeatureSpec::Location { .. } => {
                columns.push(column("longitude"));
                columns.push(column("latitude"));
            }
            FeatureSpec::DayOfYear { .. } => {
                columns.push(column("day_of_year"));
            }
            FeatureSpec::ProfileStats { columns: names } => {
                for name in names {
                    columns.push(column(name));
                }
            }
            FeatureSpec::FlankWindow {
                variables,
                flank_up,
                ..
            } => {
                for variable in variables {
                    for offset in 0..=*flank_up {
                        columns.push(column(&format!("{variable}_up_{offset}")));
                    }
                }
            }
        }
    }

    let fingerprint = schema_fingerprint(target, specs, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        target = target,
        version = FEATURE_SCHEMA_VERSION,
        column_count = columns.len(),
        fingerprint = %fingerprint
    );

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        target: target.to_string(),
        fingerprint,
        columns,
    }
}

/// Guard for downstream consumers of a persisted feature table.
pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }
    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }
    Ok(())
}

/// Run every configured feature generator over the row set and assemble the
/// feature matrix, one output row per input row.
pub fn extract_features(
    target: &str,
    inputs: &FeatureInputs<'_>,
    specs: &[FeatureSpec],
) -> Result<FeatureTable, FeatureError> {
    let schema = build_feature_schema(target, specs);

    let profile_by_key: HashMap<ProfileKey, &SelectedProfile> = inputs
        .profiles
        .iter()
        .map(|profile| (profile.profile_key(), profile))
        .collect();

    let mut matrix: Vec<Vec<f64>> = inputs
        .rows
        .iter()
        .map(|_| Vec::with_capacity(schema.columns.len()))
        .collect();

    for spec in specs {
        match spec {
            FeatureSpec::Location {
                longitude_bounds,
                latitude_bounds,
            } => {
                for (idx, row) in inputs.rows.iter().enumerate() {
                    let profile = owning_profile(&profile_by_key, row)?;
                    matrix[idx].push(maybe_scale(profile.longitude, *longitude_bounds));
                    matrix[idx].push(maybe_scale(profile.latitude, *latitude_bounds));
                }
            }
            FeatureSpec::DayOfYear { cyclic } => {
                for (idx, row) in inputs.rows.iter().enumerate() {
                    let profile = owning_profile(&profile_by_key, row)?;
                    let day = day_of_year(profile.profile_timestamp);
                    let value = if *cyclic {
                        encode_day_of_year(day)
                    } else {
                        day as f64
                    };
                    matrix[idx].push(value);
                }
            }
            FeatureSpec::ProfileStats { columns } => {
                let stats = inputs
                    .profile_stats
                    .ok_or(FeatureError::MissingStatsInput)?;
                let indices: Vec<usize> = columns
                    .iter()
                    .map(|name| {
                        stats
                            .column_index(name)
                            .ok_or_else(|| FeatureError::UnknownStatsColumn {
                                column: name.clone(),
                            })
                    })
                    .collect::<Result<_, _>>()?;

                for (idx, row) in inputs.rows.iter().enumerate() {
                    let stats_row = stats.get(&row_key(row));
                    for &stat_idx in &indices {
                        let value = stats_row.map_or(f64::NAN, |values| values[stat_idx]);
                        matrix[idx].push(value);
                    }
                }
            }
            FeatureSpec::FlankWindow {
                variables,
                flank_up,
                bounds,
            } => {
                let filtered = inputs.filtered.ok_or(FeatureError::MissingFilteredInput)?;
                for variable in variables {
                    let scale = bounds
                        .as_ref()
                        .and_then(|bounds| bounds.get(variable))
                        .copied();
                    let lookup = variable_lookup(filtered, variable, scale)?;

                    for (idx, row) in inputs.rows.iter().enumerate() {
                        let profile_values = lookup.get(&row_key(row));
                        for offset in 0..=*flank_up {
                            // Replicate the shallow boundary rather than
                            // running past the start of the profile.
                            let observation_no = (row.observation_no - offset as i64).max(1);
                            let value = profile_values
                                .and_then(|values| values.get(&observation_no))
                                .copied()
                                .unwrap_or(f64::NAN);
                            matrix[idx].push(value);
                        }
                    }
                }
            }
        }
    }

    let rows: Vec<FeatureRow> = inputs
        .rows
        .iter()
        .zip(matrix)
        .map(|(row, values)| FeatureRow {
            row_id: row.row_id,
            label: row.label,
            profile_id: row.profile_id,
            pair_id: row.pair_id.clone(),
            values,
        })
        .collect();

    info!(
        component = "features",
        event = "features.extract.finish",
        target = target,
        rows = rows.len(),
        columns = schema.columns.len()
    );

    Ok(FeatureTable { schema, rows })
}

fn column(name: &str) -> FeatureColumn {
    FeatureColumn {
        name: name.to_string(),
        dtype: FeatureDType::F64,
    }
}

fn row_key(row: &SelectedRow) -> ProfileKey {
    ProfileKey::new(row.platform_code.clone(), row.profile_no)
}

fn owning_profile<'a>(
    profiles: &HashMap<ProfileKey, &'a SelectedProfile>,
    row: &SelectedRow,
) -> Result<&'a SelectedProfile, FeatureError> {
    profiles
        .get(&row_key(row))
        .copied()
        .ok_or_else(|| FeatureError::UnknownProfile {
            row_id: row.row_id,
            platform_code: row.platform_code.clone(),
            profile_no: row.profile_no,
        })
}

fn maybe_scale(value: f64, bounds: Option<Bounds>) -> f64 {
    match bounds {
        Some(bounds) => bounds.scale(value),
        None => value,
    }
}

/// Per-profile `observation_no -> value` lookup for one raw variable, with
/// min-max scaling applied at the source column so every window offset shares
/// the same affine transform.
fn variable_lookup(
    filtered: &ObservationTable,
    variable: &str,
    scale: Option<Bounds>,
) -> Result<HashMap<ProfileKey, HashMap<i64, f64>>, FeatureError> {
    if !filtered.has_value_column(variable) {
        return Err(FeatureError::MissingVariable {
            variable: variable.to_string(),
        });
    }

    let mut lookup: HashMap<ProfileKey, HashMap<i64, f64>> = HashMap::new();
    for row in filtered.rows() {
        let raw = row.value(variable).unwrap_or(f64::NAN);
        let value = maybe_scale(raw, scale);
        lookup
            .entry(row.profile_key())
            .or_default()
            .insert(row.observation_no, value);
    }
    Ok(lookup)
}

fn schema_fingerprint(target: &str, specs: &[FeatureSpec], columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("target:{target};version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update("specs:");
    for spec in specs {
        hasher.update(spec.kind());
        match spec {
            FeatureSpec::Location {
                longitude_bounds,
                latitude_bounds,
            } => {
                hasher.update(format!("({longitude_bounds:?},{latitude_bounds:?});"));
            }
            FeatureSpec::DayOfYear { cyclic } => {
                hasher.update(format!("(cyclic={cyclic});"));
            }
            FeatureSpec::ProfileStats { columns } => {
                hasher.update(format!("({});", columns.join(",")));
            }
            FeatureSpec::FlankWindow {
                variables,
                flank_up,
                bounds,
            } => {
                hasher.update(format!(
                    "({},up={flank_up},{bounds:?});",
                    variables.join(",")
                ));
            }
        }
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetSpec;
    use crate::observations::ObservationRow;
    use crate::profiles::{select_profiles, NEGATIVE_LABEL, POSITIVE_LABEL};
    use crate::rows::locate_rows;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn spec() -> TargetSpec {
        TargetSpec {
            flag: "temp_qc".to_string(),
            pos_flag_values: vec![4],
            neg_flag_values: vec![1],
        }
    }

    fn targets() -> BTreeMap<String, TargetSpec> {
        let mut map = BTreeMap::new();
        map.insert("temp".to_string(), spec());
        map
    }

    fn obs(
        platform: &str,
        profile_no: i64,
        observation_no: i64,
        temp: f64,
        qc: i64,
    ) -> ObservationRow {
        let mut flags = std::collections::BTreeMap::new();
        flags.insert("temp_qc".to_string(), qc);
        let mut values = std::collections::BTreeMap::new();
        values.insert("temp".to_string(), temp);
        ObservationRow {
            platform_code: platform.to_string(),
            profile_no,
            profile_timestamp: Utc.with_ymd_and_hms(2024, 4, 10, 0, 0, 0).unwrap(),
            longitude: 15.0,
            latitude: -40.0,
            pres: observation_no as f64 * 10.0,
            observation_no,
            flags,
            values,
        }
    }

    fn fixture() -> (ObservationTable, Vec<SelectedProfile>, Vec<SelectedRow>) {
        let mut rows = Vec::new();
        for no in 1..=10 {
            rows.push(obs("A", 1, no, 20.0 + no as f64, if no == 10 { 4 } else { 1 }));
        }
        for no in 1..=3 {
            rows.push(obs("B", 1, no, 10.0 + no as f64, 1));
        }
        let table = ObservationTable::from_rows(rows);
        let profiles = select_profiles(&table, &targets()).unwrap();
        let selected = locate_rows(&profiles, &table, "temp", &spec()).unwrap();
        (table, profiles, selected)
    }

    fn column_index(schema: &FeatureSchema, name: &str) -> usize {
        schema
            .columns
            .iter()
            .position(|column| column.name == name)
            .expect("column must exist")
    }

    #[test]
    fn schema_is_deterministic_and_orders_columns_by_spec() {
        let specs = vec![
            FeatureSpec::Location {
                longitude_bounds: None,
                latitude_bounds: None,
            },
            FeatureSpec::DayOfYear { cyclic: true },
            FeatureSpec::FlankWindow {
                variables: vec!["temp".to_string()],
                flank_up: 2,
                bounds: None,
            },
        ];

        let schema_a = build_feature_schema("temp", &specs);
        let schema_b = build_feature_schema("temp", &specs);
        assert_eq!(schema_a, schema_b);

        let names: Vec<&str> = schema_a
            .columns
            .iter()
            .map(|column| column.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "longitude",
                "latitude",
                "day_of_year",
                "temp_up_0",
                "temp_up_1",
                "temp_up_2"
            ]
        );

        let other = build_feature_schema("psal", &specs);
        assert_ne!(schema_a.fingerprint, other.fingerprint);
    }

    #[test]
    fn schema_compatibility_check_matches_version_and_fingerprint() {
        let specs = vec![FeatureSpec::DayOfYear { cyclic: false }];
        let schema = build_feature_schema("temp", &specs);

        assert_schema_compatible(FEATURE_SCHEMA_VERSION, &schema.fingerprint, &schema)
            .expect("compatibility should pass");

        let err =
            assert_schema_compatible(FEATURE_SCHEMA_VERSION + 1, &schema.fingerprint, &schema)
                .expect_err("version mismatch expected");
        assert!(matches!(err, FeatureError::SchemaVersionMismatch { .. }));

        let err = assert_schema_compatible(FEATURE_SCHEMA_VERSION, "not-real", &schema)
            .expect_err("fingerprint mismatch expected");
        assert!(matches!(err, FeatureError::SchemaFingerprintMismatch { .. }));
    }

    #[test]
    fn flank_window_reads_preceding_observations() {
        let (table, profiles, selected) = fixture();
        let specs = vec![FeatureSpec::FlankWindow {
            variables: vec!["temp".to_string()],
            flank_up: 2,
            bounds: None,
        }];

        let inputs = FeatureInputs {
            rows: &selected,
            profiles: &profiles,
            filtered: Some(&table),
            profile_stats: None,
        };
        let features = extract_features("temp", &inputs, &specs).unwrap();

        let positive = features
            .rows
            .iter()
            .find(|row| row.label == POSITIVE_LABEL)
            .unwrap();
        let schema = &features.schema;
        // Positive observation is number 10: offsets 0..=2 read 10, 9, 8.
        assert_eq!(positive.values[column_index(schema, "temp_up_0")], 30.0);
        assert_eq!(positive.values[column_index(schema, "temp_up_1")], 29.0);
        assert_eq!(positive.values[column_index(schema, "temp_up_2")], 28.0);
    }

    #[test]
    fn flank_window_clamps_at_the_first_observation() {
        let table = ObservationTable::from_rows(vec![
            obs("A", 1, 1, 25.0, 4),
            obs("A", 1, 2, 26.0, 1),
            obs("B", 1, 1, 12.0, 1),
        ]);
        let profiles = select_profiles(&table, &targets()).unwrap();
        let selected = locate_rows(&profiles, &table, "temp", &spec()).unwrap();
        let specs = vec![FeatureSpec::FlankWindow {
            variables: vec!["temp".to_string()],
            flank_up: 2,
            bounds: None,
        }];

        let inputs = FeatureInputs {
            rows: &selected,
            profiles: &profiles,
            filtered: Some(&table),
            profile_stats: None,
        };
        let features = extract_features("temp", &inputs, &specs).unwrap();
        let schema = &features.schema;

        let positive = features
            .rows
            .iter()
            .find(|row| row.label == POSITIVE_LABEL)
            .unwrap();
        for name in ["temp_up_0", "temp_up_1", "temp_up_2"] {
            assert_eq!(positive.values[column_index(schema, name)], 25.0);
        }
    }

    #[test]
    fn flank_scaling_is_applied_at_the_source_column() {
        let (table, profiles, selected) = fixture();
        let mut bounds = BTreeMap::new();
        bounds.insert(
            "temp".to_string(),
            Bounds {
                min: 20.0,
                max: 30.0,
            },
        );
        let specs = vec![FeatureSpec::FlankWindow {
            variables: vec!["temp".to_string()],
            flank_up: 1,
            bounds: Some(bounds),
        }];

        let inputs = FeatureInputs {
            rows: &selected,
            profiles: &profiles,
            filtered: Some(&table),
            profile_stats: None,
        };
        let features = extract_features("temp", &inputs, &specs).unwrap();
        let schema = &features.schema;

        let positive = features
            .rows
            .iter()
            .find(|row| row.label == POSITIVE_LABEL)
            .unwrap();
        // temp 30.0 scales to 1.0, temp 29.0 to 0.9, on the shared bounds.
        assert_eq!(positive.values[column_index(schema, "temp_up_0")], 1.0);
        assert!((positive.values[column_index(schema, "temp_up_1")] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn flank_window_without_filtered_input_is_a_missing_input_error() {
        let (_, profiles, selected) = fixture();
        let specs = vec![FeatureSpec::FlankWindow {
            variables: vec!["temp".to_string()],
            flank_up: 1,
            bounds: None,
        }];

        let inputs = FeatureInputs {
            rows: &selected,
            profiles: &profiles,
            filtered: None,
            profile_stats: None,
        };
        let err = extract_features("temp", &inputs, &specs).unwrap_err();
        assert!(matches!(err, FeatureError::MissingFilteredInput));
    }

    #[test]
    fn location_and_day_of_year_resolve_via_owning_profile() {
        let (table, profiles, selected) = fixture();
        let specs = vec![
            FeatureSpec::Location {
                longitude_bounds: Some(Bounds {
                    min: -180.0,
                    max: 180.0,
                }),
                latitude_bounds: None,
            },
            FeatureSpec::DayOfYear { cyclic: false },
        ];

        let inputs = FeatureInputs {
            rows: &selected,
            profiles: &profiles,
            filtered: Some(&table),
            profile_stats: None,
        };
        let features = extract_features("temp", &inputs, &specs).unwrap();
        let schema = &features.schema;

        let row = &features.rows[0];
        assert!(
            (row.values[column_index(schema, "longitude")] - (15.0 + 180.0) / 360.0).abs() < 1e-12
        );
        assert_eq!(row.values[column_index(schema, "latitude")], -40.0);
        // 2024-04-10 is day 101 of a leap year.
        assert_eq!(row.values[column_index(schema, "day_of_year")], 101.0);
    }

    #[test]
    fn cyclic_day_of_year_stays_in_unit_interval() {
        for day in 1..=366 {
            let encoded = encode_day_of_year(day);
            assert!((0.0..=1.0).contains(&encoded), "day {day} -> {encoded}");
        }
    }

    #[test]
    fn profile_stats_join_yields_nan_for_missing_profiles() {
        let (_, profiles, selected) = fixture();
        let mut stats = ProfileStatsTable::new(vec!["temp_mean".to_string()]);
        stats.insert(ProfileKey::new("A", 1), vec![25.5]).unwrap();

        let specs = vec![FeatureSpec::ProfileStats {
            columns: vec!["temp_mean".to_string()],
        }];
        let inputs = FeatureInputs {
            rows: &selected,
            profiles: &profiles,
            filtered: None,
            profile_stats: Some(&stats),
        };
        let features = extract_features("temp", &inputs, &specs).unwrap();
        let schema = &features.schema;

        let positive = features
            .rows
            .iter()
            .find(|row| row.label == POSITIVE_LABEL)
            .unwrap();
        assert_eq!(positive.values[column_index(schema, "temp_mean")], 25.5);

        // Profile B has no statistics row.
        let negative = features
            .rows
            .iter()
            .find(|row| row.label == NEGATIVE_LABEL)
            .unwrap();
        assert!(negative.values[column_index(schema, "temp_mean")].is_nan());
    }

    #[test]
    fn unknown_stats_column_is_rejected() {
        let (_, profiles, selected) = fixture();
        let stats = ProfileStatsTable::new(vec!["temp_mean".to_string()]);
        let specs = vec![FeatureSpec::ProfileStats {
            columns: vec!["temp_median".to_string()],
        }];
        let inputs = FeatureInputs {
            rows: &selected,
            profiles: &profiles,
            filtered: None,
            profile_stats: Some(&stats),
        };
        let err = extract_features("temp", &inputs, &specs).unwrap_err();
        assert!(matches!(err, FeatureError::UnknownStatsColumn { .. }));
    }

    #[test]
    fn missing_stats_input_is_rejected() {
        let (_, profiles, selected) = fixture();
        let specs = vec![FeatureSpec::ProfileStats {
            columns: vec!["temp_mean".to_string()],
        }];
        let inputs = FeatureInputs {
            rows: &selected,
            profiles: &profiles,
            filtered: None,
            profile_stats: None,
        };
        let err = extract_features("temp", &inputs, &specs).unwrap_err();
        assert!(matches!(err, FeatureError::MissingStatsInput));
    }
}
