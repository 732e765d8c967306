//! # Analysis Configuration
//!
//! Every column the analysis touches is named here, once, in a TOML file.
//! The loaders resolve these names against the file headers at load time, so a
//! misspelled column fails before any computation starts.

use crate::codes::{CodeError, Codebook};
use ahash::AHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Treatment assignment of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arm {
    Control,
    Treatment,
}

impl Arm {
    pub fn label(self) -> &'static str {
        match self {
            Arm::Control => "control",
            Arm::Treatment => "treatment",
        }
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Column layout of the individual-level respondent table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondentColumns {
    /// Cluster (school) identifier column.
    pub cluster: String,
    /// Optional respondent identifier column; row numbers are used when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Itemized incident-type columns, each answered independently.
    pub itemized: Vec<String>,
    /// The two lifetime-total columns.
    pub lifetime: [String; 2],
    /// Baseline covariates compared across arms.
    #[serde(default)]
    pub balance: Vec<String>,
}

/// Raw-code vocabulary: a default codebook plus per-item additions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodesConfig {
    #[serde(flatten)]
    pub default: Codebook,
    #[serde(default)]
    pub items: BTreeMap<String, ItemCodes>,
}

/// Extra codes for a single item, added to the `[codes]` table. Inherited
/// codes keep their category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ItemCodes {
    pub missing: Vec<String>,
    pub refused: Vec<String>,
    pub dont_know: Vec<String>,
}

impl ItemCodes {
    /// `base` with this item's codes appended to each category.
    pub fn extend(&self, base: &Codebook) -> Codebook {
        let join = |inherited: &[String], own: &[String]| -> Vec<String> {
            inherited.iter().chain(own).unique().cloned().collect()
        };
        Codebook {
            missing: join(&base.missing, &self.missing),
            refused: join(&base.refused, &self.refused),
            dont_know: join(&base.dont_know, &self.dont_know),
        }
    }
}

impl CodesConfig {
    /// The codebook that applies to `item`: the `[codes]` table plus the
    /// item's own codes, if any.
    pub fn for_item(&self, item: &str) -> Codebook {
        match self.items.get(item) {
            Some(extra) => extra.extend(&self.default),
            None => self.default.clone(),
        }
    }
}

/// Cluster-to-arm mapping supplied by the analyst.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArmsConfig {
    #[serde(default)]
    pub treatment: Vec<String>,
    #[serde(default)]
    pub control: Vec<String>,
}

/// A feature derived as `numerator / denominator` from two school columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioFeature {
    pub name: String,
    pub numerator: String,
    pub denominator: String,
}

/// Column layout of the school-level table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchoolColumns {
    pub id: String,
    pub outcome: String,
    pub weight: String,
    /// Predictors screened by `scan` when none are given on the command line.
    pub predictors: Vec<String>,
    /// Columns treated as categorical even if every value is numeric.
    pub categorical: Vec<String>,
    pub ratios: Vec<RatioFeature>,
}

impl Default for SchoolColumns {
    fn default() -> Self {
        Self {
            id: "school_id".into(),
            outcome: "outcome_rate".into(),
            weight: "respondents".into(),
            predictors: Vec::new(),
            categorical: Vec::new(),
            ratios: Vec::new(),
        }
    }
}

/// Settings for the cluster bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    pub replicates: usize,
    /// Base seed; a fresh one is drawn from entropy when absent.
    pub seed: Option<u64>,
    /// Two-sided confidence level of the percentile interval.
    pub confidence: f64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            replicates: 1000,
            seed: None,
            confidence: 0.95,
        }
    }
}

/// The complete analysis description loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub respondents: RespondentColumns,
    #[serde(default)]
    pub codes: CodesConfig,
    #[serde(default)]
    pub arms: ArmsConfig,
    #[serde(default)]
    pub schools: SchoolColumns,
    #[serde(default)]
    pub bootstrap: BootstrapSettings,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid codebook for '{item}': {source}")]
    Codebook {
        item: String,
        #[source]
        source: CodeError,
    },
    #[error("At least one itemized incident column must be configured.")]
    NoItemizedColumns,
    #[error("Column '{0}' is configured more than once in the same column list.")]
    DuplicateColumn(String),
    #[error("Both lifetime columns are named '{0}'; two distinct columns are required.")]
    DuplicateLifetimeColumn(String),
    #[error("Cluster '{0}' is assigned to both the treatment and the control arm.")]
    ConflictingArm(String),
    #[error("No clusters are assigned to any arm. Add a [arms] table to the configuration.")]
    NoArms,
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Out-of-range bootstrap settings, from the file or the command line.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum SettingsError {
    #[error("Bootstrap confidence must lie strictly between 0 and 1, got {0}.")]
    InvalidConfidence(f64),
    #[error("Bootstrap replicate count must be at least 1.")]
    NoReplicates,
}

impl AnalysisConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        log::info!("Loaded analysis configuration from '{}'", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let columns = &self.respondents;
        if columns.itemized.is_empty() {
            return Err(ConfigError::NoItemizedColumns);
        }
        ensure_unique(&columns.itemized)?;
        ensure_unique(&columns.balance)?;
        if columns.lifetime[0] == columns.lifetime[1] {
            return Err(ConfigError::DuplicateLifetimeColumn(
                columns.lifetime[0].clone(),
            ));
        }

        self.codes
            .default
            .validate()
            .map_err(|source| ConfigError::Codebook {
                item: "default".into(),
                source,
            })?;
        for item in self.codes.items.keys() {
            self.codes
                .for_item(item)
                .validate()
                .map_err(|source| ConfigError::Codebook {
                    item: item.clone(),
                    source,
                })?;
        }

        if self.arms.treatment.is_empty() && self.arms.control.is_empty() {
            return Err(ConfigError::NoArms);
        }
        if let Some(cluster) = self
            .arms
            .treatment
            .iter()
            .find(|cluster| self.arms.control.contains(cluster))
        {
            return Err(ConfigError::ConflictingArm(cluster.clone()));
        }

        Ok(self.bootstrap.validate()?)
    }

    /// Lookup table from cluster id to arm.
    pub fn arm_map(&self) -> AHashMap<String, Arm> {
        let treated = self
            .arms
            .treatment
            .iter()
            .map(|cluster| (cluster.clone(), Arm::Treatment));
        let control = self
            .arms
            .control
            .iter()
            .map(|cluster| (cluster.clone(), Arm::Control));
        treated.chain(control).collect()
    }
}

impl BootstrapSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.replicates == 0 {
            return Err(SettingsError::NoReplicates);
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(SettingsError::InvalidConfidence(self.confidence));
        }
        Ok(())
    }

    /// The configured seed, or a fresh one from entropy. A drawn seed is
    /// logged so the run can be repeated.
    pub fn resolve_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            let drawn = rand::random::<u64>();
            log::info!("No bootstrap seed supplied; using {drawn}");
            drawn
        })
    }
}

fn ensure_unique(columns: &[String]) -> Result<(), ConfigError> {
    for (i, column) in columns.iter().enumerate() {
        if columns[..i].contains(column) {
            return Err(ConfigError::DuplicateColumn(column.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[respondents]
cluster = "school"
itemized = ["hit", "kick", "lifetime_a"]
lifetime = ["lifetime_a", "lifetime_b"]

[arms]
treatment = ["S1", "S3"]
control = ["S2"]
"#;

    #[test]
    fn minimal_configuration_gets_defaults() {
        let config = AnalysisConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.respondents.cluster, "school");
        assert!(config.respondents.id.is_none());
        assert_eq!(config.bootstrap.replicates, 1000);
        assert_eq!(config.bootstrap.confidence, 0.95);
        assert_eq!(config.schools.id, "school_id");
        assert_eq!(config.codes.default, Codebook::default());
        let arms = config.arm_map();
        assert_eq!(arms.get("S1"), Some(&Arm::Treatment));
        assert_eq!(arms.get("S2"), Some(&Arm::Control));
        assert_eq!(arms.get("S9"), None);
    }

    #[test]
    fn per_item_codes_extend_the_default() {
        let text = format!(
            "{MINIMAL}\n[codes]\nmissing = [\"\", \"NA\"]\nrefused = [\"-8\"]\ndont_know = [\"-9\"]\n\n[codes.items.kick]\nrefused = [\"98\"]\ndont_know = [\"99\"]\n"
        );
        let config = AnalysisConfig::from_toml(&text).unwrap();
        assert_eq!(config.codes.for_item("hit").refused, vec!["-8".to_string()]);
        assert_eq!(config.codes.for_item("kick").refused, vec!["-8", "98"]);
        assert_eq!(config.codes.for_item("kick").dont_know, vec!["-9", "99"]);
        // Categories the item leaves out come from the [codes] table, not the
        // built-in defaults.
        assert_eq!(
            config.codes.for_item("kick").missing,
            vec!["".to_string(), "NA".to_string()]
        );
    }

    #[test]
    fn partial_item_codes_keep_the_configured_categories() {
        let text = format!(
            "{MINIMAL}\n[codes]\nmissing = [\"NA\"]\nrefused = [\"-8\"]\ndont_know = [\"-99\"]\n\n[codes.items.kick]\nrefused = [\"98\"]\n"
        );
        let config = AnalysisConfig::from_toml(&text).unwrap();
        let kick = config.codes.for_item("kick");
        assert_eq!(kick.missing, vec!["NA"]);
        assert_eq!(kick.refused, vec!["-8", "98"]);
        assert_eq!(kick.dont_know, vec!["-99"]);
        assert_eq!(config.codes.for_item("hit"), config.codes.default);
    }

    #[test]
    fn item_code_colliding_with_an_inherited_category_is_rejected() {
        let text = format!(
            "{MINIMAL}\n[codes]\ndont_know = [\"-9\"]\n\n[codes.items.kick]\nmissing = [\"-9\"]\n"
        );
        match AnalysisConfig::from_toml(&text) {
            Err(ConfigError::Codebook { item, .. }) => assert_eq!(item, "kick"),
            other => panic!("expected Codebook error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_item_category_is_rejected() {
        let text = format!("{MINIMAL}\n[codes.items.kick]\nrefusd = [\"98\"]\n");
        assert!(matches!(
            AnalysisConfig::from_toml(&text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn conflicting_arm_assignment_is_rejected() {
        let text = MINIMAL.replace("control = [\"S2\"]", "control = [\"S2\", \"S3\"]");
        match AnalysisConfig::from_toml(&text) {
            Err(ConfigError::ConflictingArm(cluster)) => assert_eq!(cluster, "S3"),
            other => panic!("expected ConflictingArm, got {other:?}"),
        }
    }

    #[test]
    fn colliding_codes_are_a_configuration_error() {
        let text = format!("{MINIMAL}\n[codes.items.hit]\nmissing = [\"7\"]\nrefused = [\"7\"]\n");
        match AnalysisConfig::from_toml(&text) {
            Err(ConfigError::Codebook { item, .. }) => assert_eq!(item, "hit"),
            other => panic!("expected Codebook error, got {other:?}"),
        }
    }

    #[test]
    fn identical_lifetime_columns_are_rejected() {
        let text = MINIMAL.replace("\"lifetime_b\"]", "\"lifetime_a\"]");
        assert!(matches!(
            AnalysisConfig::from_toml(&text),
            Err(ConfigError::DuplicateLifetimeColumn(_))
        ));
    }

    #[test]
    fn configured_seed_is_used_as_is() {
        let settings = BootstrapSettings {
            seed: Some(20240611),
            ..BootstrapSettings::default()
        };
        assert_eq!(settings.resolve_seed(), 20240611);
        assert_eq!(settings.resolve_seed(), settings.resolve_seed());
    }

    #[test]
    fn bootstrap_settings_are_validated() {
        let text = format!("{MINIMAL}\n[bootstrap]\nconfidence = 1.5\n");
        assert!(matches!(
            AnalysisConfig::from_toml(&text),
            Err(ConfigError::Settings(SettingsError::InvalidConfidence(_)))
        ));
        let text = format!("{MINIMAL}\n[bootstrap]\nreplicates = 0\n");
        assert!(matches!(
            AnalysisConfig::from_toml(&text),
            Err(ConfigError::Settings(SettingsError::NoReplicates))
        ));
    }
}
