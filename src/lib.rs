//! Castprep core crate.
//!
//! Prepares labeled, pairwise-balanced training tables for profile QC
//! classifiers:
//! - observation table loading (CSV/TSV, optionally zip-packed)
//! - profile selection and day-of-year pairing
//! - per-target row location with nearest-pressure matching
//! - feature extraction (location, cyclic day-of-year, profile statistics,
//!   flank windows) with a fingerprinted schema
//! - CSV export with empty-table guards

mod config;
mod export;
mod features;
mod observability;
mod observations;
mod pipeline;
mod profiles;
mod rows;

pub use config::{
    Bounds, ConfigError, DatasetConfig, FeatureSpec, SelectionMode, TargetSpec,
};
pub use export::{
    write_feature_table, write_selected_profiles, write_selected_rows, ExportError,
};
pub use features::{
    assert_schema_compatible, build_feature_schema, encode_day_of_year, extract_features,
    FeatureColumn, FeatureDType, FeatureError, FeatureInputs, FeatureRow, FeatureSchema,
    FeatureTable, FEATURE_SCHEMA_VERSION,
};
pub use observability::{
    init_logging, log_run_finish, log_run_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use observations::{
    load_observations, load_profile_stats, ObservationLoadError, ObservationLoadReport,
    ObservationLoadResult, ObservationRow, ObservationTable, ProfileKey, ProfileStatsTable,
    StatsShapeError, REQUIRED_COLUMNS,
};
pub use pipeline::{build_dataset, filtered_input, DatasetBundle, PipelineError};
pub use profiles::{
    day_of_year, select_all_profiles, select_profiles, ProfileSelectError, SelectedProfile,
    NEGATIVE_LABEL, NO_PAIRED_PROFILE, POSITIVE_LABEL,
};
pub use rows::{locate_all_rows, locate_rows, pair_id, RowLocateError, SelectedRow};
