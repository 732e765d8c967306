//! # Respondent Data Loading and Validation
//!
//! This module is the entry point for the individual-level survey table. It
//! reads a delimited file, resolves the configured columns against the header
//! once, and turns every row into a typed [`Respondent`].
//!
//! - Strict schema: every configured column must exist. Extra columns are
//!   ignored.
//! - Loud failures: a row with the wrong number of fields, an unrecognized raw
//!   code, or a cluster absent from the arm mapping stops the load with an
//!   error naming the line.

use crate::codes::{self, CodeError, Response};
use crate::config::{AnalysisConfig, Arm};
use ahash::AHashMap;
use itertools::Itertools;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error reading delimited data: {0}")]
    Csv(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Line {line} has {found} fields, but the header declares {expected}.")]
    MalformedRow {
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("Column '{column}', line {line}: {source}")]
    UnrecognizedCode {
        column: String,
        line: u64,
        #[source]
        source: CodeError,
    },
    #[error("Line {0} has an empty cluster identifier.")]
    MissingClusterId(u64),
    #[error(
        "Cluster '{cluster}' (line {line}) is not assigned to an arm. Add it to [arms] in the configuration."
    )]
    UnassignedCluster { cluster: String, line: u64 },
    #[error("Column '{column}', line {line}: value '{value}' is not a valid number.")]
    InvalidNumber {
        column: String,
        line: u64,
        value: String,
    },
    #[error("Column '{column}', line {line}: weight {value} is negative.")]
    NegativeWeight {
        column: String,
        line: u64,
        value: f64,
    },
    #[error("Feature '{0}' is defined more than once in the school table.")]
    DuplicateFeature(String),
    #[error("Ratio feature '{feature}' uses column '{column}', which is not numeric.")]
    NonNumericRatio { feature: String, column: String },
    #[error("The input file contains no data rows.")]
    NoRows,
}

/// Column positions of the survey items, fixed once at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespondentSchema {
    /// Item names in the order their values are stored on each respondent.
    pub items: Vec<String>,
    pub itemized: Vec<usize>,
    pub lifetime: [usize; 2],
    pub balance: Vec<usize>,
}

impl RespondentSchema {
    /// Builds the item layout from the configured column lists. Items are
    /// stored once even when a column appears in more than one list.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        let columns = &config.respondents;
        let items: Vec<String> = columns
            .itemized
            .iter()
            .chain(columns.lifetime.iter())
            .chain(columns.balance.iter())
            .unique()
            .cloned()
            .collect();
        let position = |name: &String| {
            items
                .iter()
                .position(|item| item == name)
                .unwrap_or_else(|| unreachable!("'{name}' was collected into the item list"))
        };
        Self {
            itemized: columns.itemized.iter().map(position).collect(),
            lifetime: [position(&columns.lifetime[0]), position(&columns.lifetime[1])],
            balance: columns.balance.iter().map(position).collect(),
            items,
        }
    }
}

/// One survey respondent.
#[derive(Debug, Clone, PartialEq)]
pub struct Respondent {
    pub id: String,
    pub cluster: String,
    pub arm: Arm,
    /// Normalized answers, one per schema item.
    pub responses: Vec<Response>,
}

/// The validated respondent table.
#[derive(Debug, Clone)]
pub struct RespondentTable {
    pub schema: RespondentSchema,
    pub respondents: Vec<Respondent>,
}

impl RespondentTable {
    /// Respondent indices grouped by cluster, clusters in natural order
    /// (`S2` before `S10`).
    pub fn clusters(&self) -> Vec<(&str, Vec<usize>)> {
        let mut groups: AHashMap<&str, Vec<usize>> = AHashMap::new();
        for (index, respondent) in self.respondents.iter().enumerate() {
            groups
                .entry(respondent.cluster.as_str())
                .or_default()
                .push(index);
        }
        groups
            .into_iter()
            .sorted_by(|a, b| natord::compare(a.0, b.0))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.respondents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.respondents.is_empty()
    }
}

/// Chooses the field delimiter from the file extension: tab for `.tsv` and
/// `.tab`, comma otherwise.
pub fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") || ext.eq_ignore_ascii_case("tab") => b'\t',
        _ => b',',
    }
}

pub(crate) fn open_reader<R: Read>(reader: R, delimiter: u8) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader)
}

/// Resolves each requested column name to its header position.
pub(crate) fn resolve_columns(
    headers: &csv::StringRecord,
    names: &[String],
) -> Result<Vec<usize>, DataError> {
    names
        .iter()
        .map(|name| {
            headers
                .iter()
                .position(|header| header == name)
                .ok_or_else(|| DataError::ColumnNotFound(name.clone()))
        })
        .collect()
}

pub(crate) fn record_line(record: &csv::StringRecord) -> u64 {
    record.position().map(|pos| pos.line()).unwrap_or(0)
}

pub(crate) fn check_width(record: &csv::StringRecord, expected: usize) -> Result<(), DataError> {
    if record.len() != expected {
        return Err(DataError::MalformedRow {
            line: record_line(record),
            expected,
            found: record.len(),
        });
    }
    Ok(())
}

/// Loads and validates the respondent table at `path`.
pub fn load_respondents(
    path: &Path,
    config: &AnalysisConfig,
) -> Result<RespondentTable, DataError> {
    log::info!("Loading respondents from '{}'", path.display());
    let file = File::open(path)?;
    let table = read_respondents(file, delimiter_for(path), config)?;
    log::info!(
        "Loaded {} respondents in {} clusters ({} survey items)",
        table.len(),
        table.clusters().len(),
        table.schema.items.len()
    );
    Ok(table)
}

/// Reads a respondent table from any reader.
pub fn read_respondents<R: Read>(
    reader: R,
    delimiter: u8,
    config: &AnalysisConfig,
) -> Result<RespondentTable, DataError> {
    let schema = RespondentSchema::from_config(config);
    let arms = config.arm_map();
    let mut reader = open_reader(reader, delimiter);

    let headers = reader.headers()?.clone();
    let cluster_col = resolve_columns(&headers, std::slice::from_ref(&config.respondents.cluster))?[0];
    let id_col = match &config.respondents.id {
        Some(name) => Some(resolve_columns(&headers, std::slice::from_ref(name))?[0]),
        None => None,
    };
    let item_cols = resolve_columns(&headers, &schema.items)?;
    let codebooks: Vec<_> = schema
        .items
        .iter()
        .map(|item| config.codes.for_item(item))
        .collect();

    let mut respondents = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        check_width(&record, headers.len())?;
        let line = record_line(&record);

        let cluster = record[cluster_col].to_string();
        if cluster.is_empty() {
            return Err(DataError::MissingClusterId(line));
        }
        let arm = *arms
            .get(&cluster)
            .ok_or_else(|| DataError::UnassignedCluster {
                cluster: cluster.clone(),
                line,
            })?;

        let id = match id_col {
            Some(col) if !record[col].is_empty() => record[col].to_string(),
            _ => (row + 1).to_string(),
        };

        let responses = item_cols
            .iter()
            .zip(&codebooks)
            .zip(&schema.items)
            .map(|((&col, codebook), item)| {
                codes::normalize(record.get(col), codebook).map_err(|source| {
                    DataError::UnrecognizedCode {
                        column: item.clone(),
                        line,
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        respondents.push(Respondent {
            id,
            cluster,
            arm,
            responses,
        });
    }

    if respondents.is_empty() {
        return Err(DataError::NoRows);
    }

    Ok(RespondentTable {
        schema,
        respondents,
    })
}
