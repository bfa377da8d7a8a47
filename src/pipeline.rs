//! Dataset pipeline driver: select profiles, locate rows, extract features.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, DatasetConfig, SelectionMode};
use crate::features::{extract_features, FeatureError, FeatureInputs, FeatureTable};
use crate::observations::{ObservationTable, ProfileStatsTable};
use crate::profiles::{
    select_all_profiles, select_profiles, ProfileSelectError, SelectedProfile,
};
use crate::rows::{locate_all_rows, locate_rows, RowLocateError, SelectedRow};

/// All tables produced by one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetBundle {
    pub selected_profiles: Vec<SelectedProfile>,
    pub selected_rows: BTreeMap<String, Vec<SelectedRow>>,
    pub target_features: BTreeMap<String, FeatureTable>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("profile selection failed: {0}")]
    ProfileSelect(#[from] ProfileSelectError),
    #[error("row location failed for target {target}: {source}")]
    RowLocate {
        target: String,
        source: RowLocateError,
    },
    #[error("feature extraction failed for target {target}: {source}")]
    Feature {
        target: String,
        source: FeatureError,
    },
}

/// Run the full pipeline over one observation snapshot.
///
/// Targets are independent slices over shared read-only tables; with the
/// `parallel` feature each target's locate+extract runs on the rayon pool.
pub fn build_dataset(
    observations: &ObservationTable,
    config: &DatasetConfig,
    profile_stats: Option<&ProfileStatsTable>,
) -> Result<DatasetBundle, PipelineError> {
    config.validate()?;
    config.validate_against(observations)?;

    info!(
        component = "pipeline",
        event = "pipeline.build.start",
        targets = config.targets.len(),
        features = config.features.len(),
        mode = ?config.mode,
        observations = observations.len()
    );

    let selected_profiles = match config.mode {
        SelectionMode::Paired => select_profiles(observations, &config.targets)?,
        SelectionMode::All => select_all_profiles(observations),
    };

    let filtered = if config.needs_filtered_input() {
        Some(filtered_input(
            observations,
            &selected_profiles,
            config.max_pres,
        ))
    } else {
        None
    };

    let outputs = run_targets(
        observations,
        config,
        &selected_profiles,
        filtered.as_ref(),
        profile_stats,
    )?;

    let mut selected_rows = BTreeMap::new();
    let mut target_features = BTreeMap::new();
    for (target, rows, features) in outputs {
        selected_rows.insert(target.clone(), rows);
        target_features.insert(target, features);
    }

    info!(
        component = "pipeline",
        event = "pipeline.build.finish",
        selected_profiles = selected_profiles.len(),
        targets = target_features.len()
    );

    Ok(DatasetBundle {
        selected_profiles,
        selected_rows,
        target_features,
    })
}

/// Observation view restricted to selected profiles, with observations below
/// the optional pressure cap dropped.
pub fn filtered_input(
    observations: &ObservationTable,
    selected_profiles: &[SelectedProfile],
    max_pres: Option<f64>,
) -> ObservationTable {
    let keys: HashSet<_> = selected_profiles
        .iter()
        .map(SelectedProfile::profile_key)
        .collect();

    let rows: Vec<_> = observations
        .rows()
        .iter()
        .filter(|row| keys.contains(&row.profile_key()))
        .filter(|row| max_pres.map_or(true, |cap| row.pres <= cap))
        .cloned()
        .collect();

    let filtered = ObservationTable::from_rows(rows);
    info!(
        component = "pipeline",
        event = "pipeline.filtered_input.built",
        input_rows = observations.len(),
        filtered_rows = filtered.len(),
        max_pres = ?max_pres
    );
    filtered
}

type TargetOutput = (String, Vec<SelectedRow>, FeatureTable);

fn run_one_target(
    target: &str,
    observations: &ObservationTable,
    config: &DatasetConfig,
    selected_profiles: &[SelectedProfile],
    filtered: Option<&ObservationTable>,
    profile_stats: Option<&ProfileStatsTable>,
) -> Result<TargetOutput, PipelineError> {
    let spec = &config.targets[target];
    let rows = match config.mode {
        SelectionMode::Paired => locate_rows(selected_profiles, observations, target, spec),
        SelectionMode::All => locate_all_rows(observations, target, spec),
    }
    .map_err(|source| PipelineError::RowLocate {
        target: target.to_string(),
        source,
    })?;

    let inputs = FeatureInputs {
        rows: &rows,
        profiles: selected_profiles,
        filtered,
        profile_stats,
    };
    let features =
        extract_features(target, &inputs, &config.features).map_err(|source| {
            PipelineError::Feature {
                target: target.to_string(),
                source,
            }
        })?;

    Ok((target.to_string(), rows, features))
}

#[cfg(feature = "parallel")]
fn run_targets(
    observations: &ObservationTable,
    config: &DatasetConfig,
    selected_profiles: &[SelectedProfile],
    filtered: Option<&ObservationTable>,
    profile_stats: Option<&ProfileStatsTable>,
) -> Result<Vec<TargetOutput>, PipelineError> {
    use rayon::prelude::*;

    let targets: Vec<&String> = config.targets.keys().collect();
    targets
        .par_iter()
        .map(|target| {
            run_one_target(
                target.as_str(),
                observations,
                config,
                selected_profiles,
                filtered,
                profile_stats,
            )
        })
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn run_targets(
    observations: &ObservationTable,
    config: &DatasetConfig,
    selected_profiles: &[SelectedProfile],
    filtered: Option<&ObservationTable>,
    profile_stats: Option<&ProfileStatsTable>,
) -> Result<Vec<TargetOutput>, PipelineError> {
    config
        .targets
        .keys()
        .map(|target| {
            run_one_target(
                target.as_str(),
                observations,
                config,
                selected_profiles,
                filtered,
                profile_stats,
            )
        })
        .collect()
}
