//! Typed dataset configuration and up-front validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observations::ObservationTable;

/// Per-target QC flag metadata: which column to inspect and which codes count
/// as bad (positive) or good (negative).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub flag: String,
    pub pos_flag_values: Vec<i64>,
    pub neg_flag_values: Vec<i64>,
}

impl TargetSpec {
    pub fn is_positive(&self, flag: i64) -> bool {
        self.pos_flag_values.contains(&flag)
    }

    pub fn is_negative(&self, flag: i64) -> bool {
        self.neg_flag_values.contains(&flag)
    }
}

/// Externally supplied min-max scaling bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn scale(self, x: f64) -> f64 {
        (x - self.min) / (self.max - self.min)
    }
}

/// Closed set of feature kinds; an unknown kind fails at deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "feature", rename_all = "snake_case")]
pub enum FeatureSpec {
    Location {
        #[serde(default)]
        longitude_bounds: Option<Bounds>,
        #[serde(default)]
        latitude_bounds: Option<Bounds>,
    },
    DayOfYear {
        #[serde(default)]
        cyclic: bool,
    },
    ProfileStats {
        columns: Vec<String>,
    },
    FlankWindow {
        variables: Vec<String>,
        flank_up: u32,
        #[serde(default)]
        bounds: Option<BTreeMap<String, Bounds>>,
    },
}

impl FeatureSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Location { .. } => "location",
            Self::DayOfYear { .. } => "day_of_year",
            Self::ProfileStats { .. } => "profile_stats",
            Self::FlankWindow { .. } => "flank_window",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Positive/negative labeling with profile and row pairing.
    Paired,
    /// Keep every profile and every flagged observation, no pairing.
    All,
}

impl Default for SelectionMode {
    fn default() -> Self {
        Self::Paired
    }
}

/// Resolved dataset configuration, consumed as an opaque value by the
/// pipeline. Produced by the external configuration layer (JSON in the
/// bundled binary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub targets: BTreeMap<String, TargetSpec>,
    pub features: Vec<FeatureSpec>,
    #[serde(default)]
    pub mode: SelectionMode,
    #[serde(default)]
    pub max_pres: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("at least one target must be configured")]
    EmptyTargets,
    #[error("target {target} has an empty {which} flag value set")]
    EmptyFlagValues {
        target: String,
        which: &'static str,
    },
    #[error("target {target} lists flag value {value} as both positive and negative")]
    OverlappingFlagValues { target: String, value: i64 },
    #[error("flag column {column} for target {target} is missing from the observation table")]
    MissingFlagColumn { target: String, column: String },
    #[error("flank window variable {variable} is missing from the observation table")]
    MissingVariableColumn { variable: String },
    #[error("flank window feature requires at least one variable")]
    EmptyFlankVariables,
    #[error("invalid bounds for {context}: min {min} must be below max {max}")]
    InvalidBounds {
        context: String,
        min: f64,
        max: f64,
    },
    #[error("scaling bounds for flank variable {variable} are missing")]
    MissingScaleBounds { variable: String },
    #[error("profile statistics feature requires at least one column")]
    EmptyStatsColumns,
}

impl DatasetConfig {
    /// Shape-only validation: flag sets, feature parameters, bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::EmptyTargets);
        }

        for (name, spec) in &self.targets {
            if spec.pos_flag_values.is_empty() {
                return Err(ConfigError::EmptyFlagValues {
                    target: name.clone(),
                    which: "positive",
                });
            }
            if spec.neg_flag_values.is_empty() {
                return Err(ConfigError::EmptyFlagValues {
                    target: name.clone(),
                    which: "negative",
                });
            }
            if let Some(value) = spec
                .pos_flag_values
                .iter()
                .copied()
                .find(|value| spec.neg_flag_values.contains(value))
            {
                return Err(ConfigError::OverlappingFlagValues {
                    target: name.clone(),
                    value,
                });
            }
        }

        for feature in &self.features {
            validate_feature(feature)?;
        }

        Ok(())
    }

    /// Column-level validation against a concrete observation table. Runs
    /// after [`validate`](Self::validate), before any pipeline stage.
    pub fn validate_against(&self, observations: &ObservationTable) -> Result<(), ConfigError> {
        for (name, spec) in &self.targets {
            if !observations.has_flag_column(&spec.flag) {
                return Err(ConfigError::MissingFlagColumn {
                    target: name.clone(),
                    column: spec.flag.clone(),
                });
            }
        }

        for feature in &self.features {
            if let FeatureSpec::FlankWindow { variables, .. } = feature {
                for variable in variables {
                    if !observations.has_value_column(variable) {
                        return Err(ConfigError::MissingVariableColumn {
                            variable: variable.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// True when any configured feature needs the filtered observation table.
    pub fn needs_filtered_input(&self) -> bool {
        self.features
            .iter()
            .any(|feature| matches!(feature, FeatureSpec::FlankWindow { .. }))
    }
}

fn validate_feature(feature: &FeatureSpec) -> Result<(), ConfigError> {
    match feature {
        FeatureSpec::Location {
            longitude_bounds,
            latitude_bounds,
        } => {
            if let Some(bounds) = longitude_bounds {
                validate_bounds("longitude", *bounds)?;
            }
            if let Some(bounds) = latitude_bounds {
                validate_bounds("latitude", *bounds)?;
            }
            Ok(())
        }
        FeatureSpec::DayOfYear { .. } => Ok(()),
        FeatureSpec::ProfileStats { columns } => {
            if columns.is_empty() {
                return Err(ConfigError::EmptyStatsColumns);
            }
            Ok(())
        }
        FeatureSpec::FlankWindow {
            variables, bounds, ..
        } => {
            if variables.is_empty() {
                return Err(ConfigError::EmptyFlankVariables);
            }
            if let Some(bounds) = bounds {
                for variable in variables {
                    let entry = bounds.get(variable).ok_or_else(|| {
                        ConfigError::MissingScaleBounds {
                            variable: variable.clone(),
                        }
                    })?;
                    validate_bounds(variable, *entry)?;
                }
            }
            Ok(())
        }
    }
}

fn validate_bounds(context: &str, bounds: Bounds) -> Result<(), ConfigError> {
    if !(bounds.min < bounds.max) {
        return Err(ConfigError::InvalidBounds {
            context: context.to_string(),
            min: bounds.min,
            max: bounds.max,
        });
    }
    Ok(())
}
