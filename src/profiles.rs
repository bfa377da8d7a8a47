//! Profile selection: positive/negative labeling and day-of-year pairing.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::TargetSpec;
use crate::observations::{ObservationTable, ProfileKey};

pub const POSITIVE_LABEL: u8 = 1;
pub const NEGATIVE_LABEL: u8 = 0;

/// Sentinel for "no paired negative profile".
pub const NO_PAIRED_PROFILE: i64 = 0;

/// One labeled profile of the `selected_profiles` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedProfile {
    pub platform_code: String,
    pub profile_no: i64,
    pub profile_timestamp: DateTime<Utc>,
    pub longitude: f64,
    pub latitude: f64,
    pub profile_id: i64,
    pub neg_profile_id: i64,
    pub label: u8,
}

impl SelectedProfile {
    pub fn profile_key(&self) -> ProfileKey {
        ProfileKey::new(self.platform_code.clone(), self.profile_no)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ProfileSelectError {
    #[error("flag column {column} for target {target} is missing from the observation table")]
    MissingFlagColumn { target: String, column: String },
}

/// Ordinal day-of-year (1..=366) of a profile timestamp.
pub fn day_of_year(timestamp: DateTime<Utc>) -> u32 {
    timestamp.ordinal()
}

/// Label and pair profiles.
///
/// A profile is positive when any observation carries a positive flag for any
/// monitored variable; negative when, for every monitored variable, no
/// observation carries a positive flag and at least one carries a negative
/// flag. Positive ids are assigned 1..=P over the key-sorted positive set,
/// negative ids continue from P+1; each positive is paired to the negative
/// with the closest day-of-year (ties to the smallest negative id), and
/// negatives never referenced by a pairing are dropped.
pub fn select_profiles(
    observations: &ObservationTable,
    targets: &BTreeMap<String, TargetSpec>,
) -> Result<Vec<SelectedProfile>, ProfileSelectError> {
    for (name, spec) in targets {
        if !observations.has_flag_column(&spec.flag) {
            return Err(ProfileSelectError::MissingFlagColumn {
                target: name.clone(),
                column: spec.flag.clone(),
            });
        }
    }

    let aggregates = aggregate_profiles(observations, targets);

    let mut positives = Vec::new();
    let mut negatives = Vec::new();
    for (key, agg) in &aggregates {
        if agg.has_pos.iter().any(|&p| p) {
            positives.push((key, agg));
        } else if agg
            .has_pos
            .iter()
            .zip(agg.has_neg.iter())
            .all(|(&p, &n)| !p && n)
        {
            negatives.push((key, agg));
        }
    }

    let positive_count = positives.len() as i64;
    let mut selected: Vec<SelectedProfile> = positives
        .iter()
        .enumerate()
        .map(|(idx, (key, agg))| make_profile(key, agg, idx as i64 + 1, POSITIVE_LABEL))
        .collect();

    let negative_profiles: Vec<SelectedProfile> = negatives
        .iter()
        .enumerate()
        .map(|(idx, (key, agg))| {
            make_profile(key, agg, positive_count + idx as i64 + 1, NEGATIVE_LABEL)
        })
        .collect();

    let mut referenced = BTreeSet::new();
    for profile in &mut selected {
        let doy = day_of_year(profile.profile_timestamp) as i64;
        let mut best: Option<(i64, i64)> = None;
        for candidate in &negative_profiles {
            let diff = (doy - day_of_year(candidate.profile_timestamp) as i64).abs();
            let closer = match best {
                None => true,
                Some((best_diff, _)) => diff < best_diff,
            };
            if closer {
                best = Some((diff, candidate.profile_id));
            }
        }
        if let Some((_, neg_id)) = best {
            profile.neg_profile_id = neg_id;
            referenced.insert(neg_id);
        }
    }

    selected.extend(
        negative_profiles
            .into_iter()
            .filter(|profile| referenced.contains(&profile.profile_id)),
    );

    info!(
        component = "profiles",
        event = "profiles.select.finish",
        candidates = aggregates.len(),
        positives = positive_count,
        paired_negatives = referenced.len(),
        selected = selected.len()
    );

    Ok(selected)
}

/// The "all profiles" variant: keep every profile, unlabeled and unpaired.
pub fn select_all_profiles(observations: &ObservationTable) -> Vec<SelectedProfile> {
    let mut metas: BTreeMap<ProfileKey, ProfileMeta> = BTreeMap::new();
    for row in observations.rows() {
        metas
            .entry(row.profile_key())
            .or_insert_with(|| ProfileMeta::of(row.profile_timestamp, row.longitude, row.latitude));
    }

    let selected: Vec<SelectedProfile> = metas
        .iter()
        .enumerate()
        .map(|(idx, (key, meta))| SelectedProfile {
            platform_code: key.platform_code.clone(),
            profile_no: key.profile_no,
            profile_timestamp: meta.timestamp,
            longitude: meta.longitude,
            latitude: meta.latitude,
            profile_id: idx as i64 + 1,
            neg_profile_id: NO_PAIRED_PROFILE,
            label: NEGATIVE_LABEL,
        })
        .collect();

    info!(
        component = "profiles",
        event = "profiles.select_all.finish",
        selected = selected.len()
    );

    selected
}

#[derive(Debug, Clone, Copy)]
struct ProfileMeta {
    timestamp: DateTime<Utc>,
    longitude: f64,
    latitude: f64,
}

impl ProfileMeta {
    fn of(timestamp: DateTime<Utc>, longitude: f64, latitude: f64) -> Self {
        Self {
            timestamp,
            longitude,
            latitude,
        }
    }
}

#[derive(Debug)]
struct ProfileAggregate {
    meta: ProfileMeta,
    has_pos: Vec<bool>,
    has_neg: Vec<bool>,
}

fn aggregate_profiles(
    observations: &ObservationTable,
    targets: &BTreeMap<String, TargetSpec>,
) -> BTreeMap<ProfileKey, ProfileAggregate> {
    let specs: Vec<&TargetSpec> = targets.values().collect();

    let mut aggregates: BTreeMap<ProfileKey, ProfileAggregate> = BTreeMap::new();
    for row in observations.rows() {
        let agg = aggregates
            .entry(row.profile_key())
            .or_insert_with(|| ProfileAggregate {
                meta: ProfileMeta::of(row.profile_timestamp, row.longitude, row.latitude),
                has_pos: vec![false; specs.len()],
                has_neg: vec![false; specs.len()],
            });

        for (idx, spec) in specs.iter().enumerate() {
            if let Some(flag) = row.flag(&spec.flag) {
                if spec.is_positive(flag) {
                    agg.has_pos[idx] = true;
                }
                if spec.is_negative(flag) {
                    agg.has_neg[idx] = true;
                }
            }
        }
    }

    aggregates
}

fn make_profile(key: &ProfileKey, agg: &ProfileAggregate, id: i64, label: u8) -> SelectedProfile {
    SelectedProfile {
        platform_code: key.platform_code.clone(),
        profile_no: key.profile_no,
        profile_timestamp: agg.meta.timestamp,
        longitude: agg.meta.longitude,
        latitude: agg.meta.latitude,
        profile_id: id,
        neg_profile_id: NO_PAIRED_PROFILE,
        label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observations::ObservationRow;
    use chrono::TimeZone;

    fn target(flag: &str) -> TargetSpec {
        TargetSpec {
            flag: flag.to_string(),
            pos_flag_values: vec![3, 4],
            neg_flag_values: vec![1, 2],
        }
    }

    fn targets() -> BTreeMap<String, TargetSpec> {
        let mut map = BTreeMap::new();
        map.insert("temp".to_string(), target("temp_qc"));
        map
    }

    fn obs(
        platform: &str,
        profile_no: i64,
        day: u32,
        observation_no: i64,
        temp_qc: i64,
    ) -> ObservationRow {
        let mut flags = std::collections::BTreeMap::new();
        flags.insert("temp_qc".to_string(), temp_qc);
        ObservationRow {
            platform_code: platform.to_string(),
            profile_no,
            profile_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
                + chrono::Duration::days(day as i64 - 1),
            longitude: 10.0,
            latitude: -20.0,
            pres: observation_no as f64 * 5.0,
            observation_no,
            flags,
            values: std::collections::BTreeMap::new(),
        }
    }

    #[test]
    fn positive_and_negative_profiles_are_partitioned() {
        let table = ObservationTable::from_rows(vec![
            obs("A", 1, 10, 1, 1),
            obs("A", 1, 10, 2, 4),
            obs("B", 1, 12, 1, 1),
            obs("B", 1, 12, 2, 2),
        ]);

        let selected = select_profiles(&table, &targets()).unwrap();
        assert_eq!(selected.len(), 2);

        let positive = &selected[0];
        assert_eq!(positive.platform_code, "A");
        assert_eq!(positive.profile_id, 1);
        assert_eq!(positive.label, POSITIVE_LABEL);
        assert_eq!(positive.neg_profile_id, 2);

        let negative = &selected[1];
        assert_eq!(negative.platform_code, "B");
        assert_eq!(negative.profile_id, 2);
        assert_eq!(negative.label, NEGATIVE_LABEL);
        assert_eq!(negative.neg_profile_id, NO_PAIRED_PROFILE);
    }

    #[test]
    fn profile_with_only_unflagged_observations_is_neither() {
        let mut row = obs("C", 1, 10, 1, 1);
        row.flags.clear();
        let table = ObservationTable::from_rows(vec![row]);

        let selected = select_profiles(&table, &targets()).unwrap();
        assert!(selected.is_empty());
    }

    #[test]
    fn pairing_picks_closest_day_of_year_with_smallest_id_tie_break() {
        let table = ObservationTable::from_rows(vec![
            obs("P", 1, 100, 1, 4),
            // Two negatives equidistant from day 100 (days 95 and 105);
            // the one with the smaller id (sorted key "M") must win.
            obs("M", 1, 95, 1, 1),
            obs("N", 1, 105, 1, 1),
        ]);

        let selected = select_profiles(&table, &targets()).unwrap();
        let positive = selected
            .iter()
            .find(|p| p.label == POSITIVE_LABEL)
            .unwrap();
        let paired = selected
            .iter()
            .find(|p| p.profile_id == positive.neg_profile_id)
            .unwrap();
        assert_eq!(paired.platform_code, "M");
    }

    #[test]
    fn unreferenced_negatives_are_dropped() {
        let table = ObservationTable::from_rows(vec![
            obs("P", 1, 100, 1, 4),
            obs("M", 1, 99, 1, 1),
            obs("Z", 1, 250, 1, 1),
        ]);

        let selected = select_profiles(&table, &targets()).unwrap();
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|p| p.platform_code != "Z"));
    }

    #[test]
    fn negative_ids_continue_after_positive_range() {
        let table = ObservationTable::from_rows(vec![
            obs("A", 1, 10, 1, 4),
            obs("A", 2, 20, 1, 3),
            obs("B", 1, 11, 1, 1),
            obs("B", 2, 21, 1, 2),
        ]);

        let selected = select_profiles(&table, &targets()).unwrap();
        let positive_ids: Vec<i64> = selected
            .iter()
            .filter(|p| p.label == POSITIVE_LABEL)
            .map(|p| p.profile_id)
            .collect();
        let negative_ids: Vec<i64> = selected
            .iter()
            .filter(|p| p.label == NEGATIVE_LABEL)
            .map(|p| p.profile_id)
            .collect();

        assert_eq!(positive_ids, vec![1, 2]);
        assert!(negative_ids.iter().all(|id| *id > 2));
    }

    #[test]
    fn positives_without_any_negative_keep_the_sentinel() {
        let table = ObservationTable::from_rows(vec![obs("A", 1, 10, 1, 4)]);
        let selected = select_profiles(&table, &targets()).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].neg_profile_id, NO_PAIRED_PROFILE);
    }

    #[test]
    fn missing_flag_column_is_a_configuration_error() {
        let mut row = obs("A", 1, 10, 1, 4);
        row.flags.clear();
        row.flags.insert("psal_qc".to_string(), 1);
        let table = ObservationTable::from_rows(vec![row]);

        let err = select_profiles(&table, &targets()).unwrap_err();
        assert_eq!(
            err,
            ProfileSelectError::MissingFlagColumn {
                target: "temp".to_string(),
                column: "temp_qc".to_string(),
            }
        );
    }

    #[test]
    fn select_all_keeps_every_profile_unpaired() {
        let table = ObservationTable::from_rows(vec![
            obs("A", 1, 10, 1, 4),
            obs("B", 1, 12, 1, 1),
            obs("C", 1, 14, 1, 9),
        ]);

        let selected = select_all_profiles(&table);
        assert_eq!(selected.len(), 3);
        assert_eq!(
            selected.iter().map(|p| p.profile_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(selected
            .iter()
            .all(|p| p.neg_profile_id == NO_PAIRED_PROFILE));
    }

    #[test]
    fn day_of_year_matches_calendar() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(day_of_year(ts), 32);
        let leap = Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(day_of_year(leap), 366);
    }
}
