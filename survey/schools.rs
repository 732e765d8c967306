//! # School-Level Table and Feature Construction
//!
//! The school table carries one row per cluster: an identifier, the outcome
//! rate, the respondent-count weight, and any number of candidate predictors.
//! Every column other than the identifier, outcome and weight becomes a
//! [`Feature`] column whose kind is inferred from its values. Ratio features
//! named in the configuration are derived here, once, and never recomputed.

use crate::config::{AnalysisConfig, RatioFeature};
use crate::data::{self, DataError};
use crate::prevalence::ClusterOutcome;
use ahash::AHashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Cell values read as "no value".
pub const MISSING_TOKENS: [&str; 5] = ["", "NA", "N/A", ".", "NaN"];

fn is_missing_token(cell: &str) -> bool {
    MISSING_TOKENS
        .iter()
        .any(|token| cell.eq_ignore_ascii_case(token))
}

/// A single predictor value.
#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    Numeric(f64),
    Category(String),
    Missing,
}

impl Feature {
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Feature::Numeric(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            Feature::Category(level) => Some(level),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Feature::Missing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Numeric,
    Categorical,
}

impl FeatureKind {
    pub fn label(self) -> &'static str {
        match self {
            FeatureKind::Numeric => "numeric",
            FeatureKind::Categorical => "categorical",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureColumn {
    pub name: String,
    pub kind: FeatureKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct School {
    pub id: String,
    /// Regression weight, normally the number of respondents.
    pub weight: f64,
    /// `None` when the outcome is undefined for this school.
    pub outcome: Option<f64>,
    /// One value per [`SchoolTable::columns`] entry.
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone)]
pub struct SchoolTable {
    pub columns: Vec<FeatureColumn>,
    pub schools: Vec<School>,
}

impl SchoolTable {
    /// Position and description of the named feature.
    pub fn column(&self, name: &str) -> Option<(usize, &FeatureColumn)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, column)| column.name == name)
    }

    pub fn len(&self) -> usize {
        self.schools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schools.is_empty()
    }

    /// Replaces each school's outcome and weight with the rate and answered
    /// count computed from respondent data. Schools without respondents get an
    /// undefined outcome. Returns the number of schools matched.
    pub fn attach_outcomes(&mut self, outcomes: &[ClusterOutcome]) -> usize {
        let by_cluster: AHashMap<&str, &ClusterOutcome> = outcomes
            .iter()
            .map(|outcome| (outcome.cluster.as_str(), outcome))
            .collect();

        let mut matched = 0;
        for school in &mut self.schools {
            match by_cluster.get(school.id.as_str()) {
                Some(outcome) => {
                    school.outcome = outcome.rate();
                    school.weight = outcome.tally.answered as f64;
                    matched += 1;
                }
                None => {
                    log::warn!(
                        "School '{}' has no respondents; its outcome is undefined",
                        school.id
                    );
                    school.outcome = None;
                    school.weight = 0.0;
                }
            }
        }

        let unmatched = outcomes
            .iter()
            .filter(|outcome| !self.schools.iter().any(|s| s.id == outcome.cluster))
            .count();
        if unmatched > 0 {
            log::warn!("{unmatched} respondent clusters do not appear in the school table");
        }
        matched
    }
}

/// Loads the school table at `path`.
pub fn load_schools(path: &Path, config: &AnalysisConfig) -> Result<SchoolTable, DataError> {
    log::info!("Loading schools from '{}'", path.display());
    let file = File::open(path)?;
    let table = read_schools(file, data::delimiter_for(path), config)?;
    let numeric = table
        .columns
        .iter()
        .filter(|column| column.kind == FeatureKind::Numeric)
        .count();
    log::info!(
        "Loaded {} schools with {} features ({} numeric, {} categorical)",
        table.len(),
        table.columns.len(),
        numeric,
        table.columns.len() - numeric
    );
    Ok(table)
}

/// Reads a school table from any reader.
pub fn read_schools<R: Read>(
    reader: R,
    delimiter: u8,
    config: &AnalysisConfig,
) -> Result<SchoolTable, DataError> {
    let layout = &config.schools;
    let mut reader = data::open_reader(reader, delimiter);
    let headers = reader.headers()?.clone();

    let id_col = data::resolve_columns(&headers, std::slice::from_ref(&layout.id))?[0];
    let position = |name: &str| headers.iter().position(|header| header == name);
    let outcome_col = position(layout.outcome.as_str());
    if outcome_col.is_none() {
        log::warn!(
            "Outcome column '{}' not found; outcomes must come from respondent data",
            layout.outcome
        );
    }
    let weight_col = position(layout.weight.as_str());
    if weight_col.is_none() {
        log::warn!(
            "Weight column '{}' not found; every school gets weight 1",
            layout.weight
        );
    }
    data::resolve_columns(&headers, &layout.categorical)?;

    let reserved = [Some(id_col), outcome_col, weight_col];
    let feature_cols: Vec<usize> = (0..headers.len())
        .filter(|col| !reserved.contains(&Some(*col)))
        .collect();

    let mut ids = Vec::new();
    let mut weights = Vec::new();
    let mut outcomes = Vec::new();
    let mut cells: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record?;
        data::check_width(&record, headers.len())?;
        let line = data::record_line(&record);

        let id = record[id_col].to_string();
        if id.is_empty() {
            return Err(DataError::MissingClusterId(line));
        }
        let outcome = match outcome_col {
            Some(col) => parse_number(&record[col], &layout.outcome, line)?,
            None => None,
        };
        let weight = match weight_col {
            Some(col) => match parse_number(&record[col], &layout.weight, line)? {
                Some(value) if value < 0.0 => {
                    return Err(DataError::NegativeWeight {
                        column: layout.weight.clone(),
                        line,
                        value,
                    });
                }
                Some(value) => value,
                None => {
                    log::warn!("School '{id}' (line {line}) has no weight and is excluded from fits");
                    0.0
                }
            },
            None => 1.0,
        };

        ids.push(id);
        weights.push(weight);
        outcomes.push(outcome);
        cells.push(feature_cols.iter().map(|&col| record[col].to_string()).collect());
    }
    if ids.is_empty() {
        return Err(DataError::NoRows);
    }

    let mut columns = Vec::with_capacity(feature_cols.len() + layout.ratios.len());
    let mut values: Vec<Vec<Feature>> = vec![Vec::new(); ids.len()];
    for (slot, &col) in feature_cols.iter().enumerate() {
        let name = headers[col].to_string();
        let raw: Vec<&str> = cells.iter().map(|row| row[slot].as_str()).collect();
        let kind = infer_kind(&raw, layout.categorical.contains(&name));
        for (row, cell) in raw.iter().enumerate() {
            values[row].push(to_feature(cell, kind));
        }
        columns.push(FeatureColumn { name, kind });
    }

    for ratio in &layout.ratios {
        if columns.iter().any(|column| column.name == ratio.name) {
            return Err(DataError::DuplicateFeature(ratio.name.clone()));
        }
        let numerator = numeric_column(&columns, ratio, &ratio.numerator)?;
        let denominator = numeric_column(&columns, ratio, &ratio.denominator)?;
        for row in values.iter_mut() {
            let derived = divide(&row[numerator], &row[denominator]);
            row.push(derived);
        }
        log::debug!(
            "Derived ratio feature '{}' = {} / {}",
            ratio.name,
            ratio.numerator,
            ratio.denominator
        );
        columns.push(FeatureColumn {
            name: ratio.name.clone(),
            kind: FeatureKind::Numeric,
        });
    }

    let schools = ids
        .into_iter()
        .zip(weights)
        .zip(outcomes)
        .zip(values)
        .map(|(((id, weight), outcome), features)| School {
            id,
            weight,
            outcome,
            features,
        })
        .collect();

    Ok(SchoolTable { columns, schools })
}

fn parse_number(cell: &str, column: &str, line: u64) -> Result<Option<f64>, DataError> {
    if is_missing_token(cell) {
        return Ok(None);
    }
    match cell.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(DataError::InvalidNumber {
            column: column.to_string(),
            line,
            value: cell.to_string(),
        }),
    }
}

fn parses_finite(cell: &str) -> bool {
    cell.parse::<f64>().is_ok_and(f64::is_finite)
}

fn infer_kind(cells: &[&str], forced_categorical: bool) -> FeatureKind {
    if forced_categorical {
        return FeatureKind::Categorical;
    }
    let numeric = cells
        .iter()
        .filter(|cell| !is_missing_token(cell))
        .all(|cell| parses_finite(cell));
    if numeric {
        FeatureKind::Numeric
    } else {
        FeatureKind::Categorical
    }
}

fn to_feature(cell: &str, kind: FeatureKind) -> Feature {
    if is_missing_token(cell) {
        return Feature::Missing;
    }
    match kind {
        FeatureKind::Numeric => cell
            .parse::<f64>()
            .map(Feature::Numeric)
            .unwrap_or(Feature::Missing),
        FeatureKind::Categorical => Feature::Category(cell.to_string()),
    }
}

fn numeric_column(
    columns: &[FeatureColumn],
    ratio: &RatioFeature,
    name: &str,
) -> Result<usize, DataError> {
    let (index, column) = columns
        .iter()
        .enumerate()
        .find(|(_, column)| column.name == name)
        .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
    if column.kind != FeatureKind::Numeric {
        return Err(DataError::NonNumericRatio {
            feature: ratio.name.clone(),
            column: name.to_string(),
        });
    }
    Ok(index)
}

/// Undefined when either side is missing or the denominator is zero.
fn divide(numerator: &Feature, denominator: &Feature) -> Feature {
    match (numerator.as_numeric(), denominator.as_numeric()) {
        (Some(a), Some(b)) if b != 0.0 => Feature::Numeric(a / b),
        _ => Feature::Missing,
    }
}
