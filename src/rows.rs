//! Row location: positive observation selection and nearest-pressure pairing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::TargetSpec;
use crate::observations::{ObservationRow, ObservationTable, ProfileKey};
use crate::profiles::{SelectedProfile, NEGATIVE_LABEL, NO_PAIRED_PROFILE, POSITIVE_LABEL};

/// One labeled observation of a `selected_rows[target]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedRow {
    pub row_id: i64,
    pub profile_id: i64,
    pub platform_code: String,
    pub profile_no: i64,
    pub observation_no: i64,
    pub pres: f64,
    pub flag: i64,
    pub label: u8,
    pub pair_id: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum RowLocateError {
    #[error("flag column {column} for target {target} is missing from the observation table")]
    MissingFlagColumn { target: String, column: String },
}

/// Key string shared by both members of a row pair: the positive side's
/// `platform_code-profile_no-observation_no`.
pub fn pair_id(platform_code: &str, profile_no: i64, observation_no: i64) -> String {
    format!("{platform_code}-{profile_no}-{observation_no}")
}

/// Locate positive rows for `target` and pair each with the
/// nearest-in-pressure observation of its profile's paired negative profile.
///
/// Output stacks all positive rows first (profile-id then observation order),
/// then the matched negatives in the same order; `row_id` is 1-based over the
/// stack. Pressure ties resolve to the lowest `observation_no`.
pub fn locate_rows(
    profiles: &[SelectedProfile],
    observations: &ObservationTable,
    target: &str,
    spec: &TargetSpec,
) -> Result<Vec<SelectedRow>, RowLocateError> {
    ensure_flag_column(observations, target, spec)?;

    let profile_by_id: HashMap<i64, &SelectedProfile> = profiles
        .iter()
        .map(|profile| (profile.profile_id, profile))
        .collect();
    let obs_by_profile = group_observations(observations);

    // Positive side, in profile-id then observation order.
    let mut positives: Vec<(&SelectedProfile, &ObservationRow)> = Vec::new();
    let mut positive_profiles: Vec<&SelectedProfile> = profiles
        .iter()
        .filter(|profile| profile.label == POSITIVE_LABEL)
        .collect();
    positive_profiles.sort_by_key(|profile| profile.profile_id);

    for profile in positive_profiles {
        if let Some(indices) = obs_by_profile.get(&profile.profile_key()) {
            for &idx in indices {
                let row = &observations.rows()[idx];
                if row.flag(&spec.flag).is_some_and(|flag| spec.is_positive(flag)) {
                    positives.push((profile, row));
                }
            }
        }
    }

    // Negative side: one nearest-pressure candidate per positive row.
    let mut negatives: Vec<(String, &SelectedProfile, &ObservationRow)> = Vec::new();
    for (profile, positive) in &positives {
        if profile.neg_profile_id == NO_PAIRED_PROFILE {
            continue;
        }
        let Some(&neg_profile) = profile_by_id.get(&profile.neg_profile_id) else {
            continue;
        };
        let Some(candidates) = obs_by_profile.get(&neg_profile.profile_key()) else {
            continue;
        };

        let mut best: Option<(f64, &ObservationRow)> = None;
        for &idx in candidates {
            let candidate = &observations.rows()[idx];
            let diff = (candidate.pres - positive.pres).abs();
            let better = match best {
                None => true,
                Some((best_diff, best_row)) => {
                    diff < best_diff
                        || (diff == best_diff
                            && candidate.observation_no < best_row.observation_no)
                }
            };
            if better {
                best = Some((diff, candidate));
            }
        }

        if let Some((_, matched)) = best {
            let key = pair_id(
                &positive.platform_code,
                positive.profile_no,
                positive.observation_no,
            );
            negatives.push((key, neg_profile, matched));
        }
    }

    let mut selected = Vec::with_capacity(positives.len() + negatives.len());
    let mut row_id = 0i64;
    for (profile, row) in &positives {
        row_id += 1;
        selected.push(SelectedRow {
            row_id,
            profile_id: profile.profile_id,
            platform_code: row.platform_code.clone(),
            profile_no: row.profile_no,
            observation_no: row.observation_no,
            pres: row.pres,
            flag: row.flag(&spec.flag).unwrap_or_default(),
            label: POSITIVE_LABEL,
            pair_id: pair_id(&row.platform_code, row.profile_no, row.observation_no),
        });
    }
    for (key, profile, row) in &negatives {
        row_id += 1;
        selected.push(SelectedRow {
            row_id,
            profile_id: profile.profile_id,
            platform_code: row.platform_code.clone(),
            profile_no: row.profile_no,
            observation_no: row.observation_no,
            pres: row.pres,
            flag: row.flag(&spec.flag).unwrap_or_default(),
            label: NEGATIVE_LABEL,
            pair_id: key.clone(),
        });
    }

    info!(
        component = "rows",
        event = "rows.locate.finish",
        target = target,
        positive_rows = positives.len(),
        negative_rows = negatives.len()
    );

    Ok(selected)
}

/// The "locate all" variant: every observation whose flag is in the positive
/// or negative set is kept (labeled 1/0); others are excluded. No pairing,
/// empty `pair_id`, placeholder `profile_id` of 0.
pub fn locate_all_rows(
    observations: &ObservationTable,
    target: &str,
    spec: &TargetSpec,
) -> Result<Vec<SelectedRow>, RowLocateError> {
    ensure_flag_column(observations, target, spec)?;

    let mut selected = Vec::new();
    let mut row_id = 0i64;
    for row in observations.rows() {
        let Some(flag) = row.flag(&spec.flag) else {
            continue;
        };
        let label = if spec.is_positive(flag) {
            POSITIVE_LABEL
        } else if spec.is_negative(flag) {
            NEGATIVE_LABEL
        } else {
            continue;
        };

        row_id += 1;
        selected.push(SelectedRow {
            row_id,
            profile_id: 0,
            platform_code: row.platform_code.clone(),
            profile_no: row.profile_no,
            observation_no: row.observation_no,
            pres: row.pres,
            flag,
            label,
            pair_id: String::new(),
        });
    }

    info!(
        component = "rows",
        event = "rows.locate_all.finish",
        target = target,
        rows = selected.len()
    );

    Ok(selected)
}

fn ensure_flag_column(
    observations: &ObservationTable,
    target: &str,
    spec: &TargetSpec,
) -> Result<(), RowLocateError> {
    if observations.has_flag_column(&spec.flag) {
        Ok(())
    } else {
        Err(RowLocateError::MissingFlagColumn {
            target: target.to_string(),
            column: spec.flag.clone(),
        })
    }
}

fn group_observations(observations: &ObservationTable) -> HashMap<ProfileKey, Vec<usize>> {
    let mut grouped: HashMap<ProfileKey, Vec<usize>> = HashMap::new();
    for (idx, row) in observations.rows().iter().enumerate() {
        grouped.entry(row.profile_key()).or_default().push(idx);
    }
    grouped
}
