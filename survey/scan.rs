//! # Covariate Association Scanner
//!
//! One weighted univariate fit per candidate predictor against the school
//! outcome rate, weighted by respondent count. Numeric predictors get a
//! slope t-test, categorical ones a one-way ANOVA F-test. The result is a
//! screening table ranked by p-value; nothing here is adjusted for other
//! predictors.

use crate::regression::{self, Describe, RegressionError};
use crate::schools::{FeatureKind, School, SchoolTable};
use ndarray::Array1;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Predictor '{0}' is not a column of the school table.")]
    UnknownPredictor(String),
    #[error("The school table has no feature columns to scan.")]
    NoPredictors,
}

/// Sign of the association between a numeric predictor and the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Positive,
    Negative,
    Flat,
    /// Categorical predictors, and fits that could not be computed.
    NotApplicable,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Positive => "+",
            Direction::Negative => "-",
            Direction::Flat => "0",
            Direction::NotApplicable => "NA",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanRow {
    pub predictor: String,
    pub kind: FeatureKind,
    /// Schools entering the fit.
    pub n: usize,
    pub p_value: Option<f64>,
    pub direction: Direction,
    /// Slope for numeric predictors, F statistic for categorical ones.
    pub statistic: Option<f64>,
    /// Distribution of a numeric predictor over every school where it is
    /// present; `None` for categorical predictors.
    pub summary: Option<Describe>,
    /// Number of levels of a categorical predictor among fitted schools.
    pub levels: Option<usize>,
    /// Why the p-value is undefined, when it is.
    pub note: Option<String>,
}

/// Scans `predictors`, or every feature column when the list is empty.
pub fn scan_covariates(
    table: &SchoolTable,
    predictors: &[String],
) -> Result<Vec<ScanRow>, ScanError> {
    let selected: Vec<usize> = if predictors.is_empty() {
        (0..table.columns.len()).collect()
    } else {
        predictors
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .map(|(index, _)| index)
                    .ok_or_else(|| ScanError::UnknownPredictor(name.clone()))
            })
            .collect::<Result<_, _>>()?
    };
    if selected.is_empty() {
        return Err(ScanError::NoPredictors);
    }

    let usable = table
        .schools
        .iter()
        .filter(|school| school.outcome.is_some() && school.weight > 0.0)
        .count();
    log::info!(
        "Scanning {} predictors over {} schools with a defined outcome",
        selected.len(),
        usable
    );

    let mut rows: Vec<ScanRow> = selected
        .into_par_iter()
        .map(|index| scan_one(table, index))
        .collect();
    rows.sort_by(|a, b| by_p_value(a.p_value, b.p_value));
    Ok(rows)
}

/// Ascending, undefined last.
fn by_p_value(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn scan_one(table: &SchoolTable, index: usize) -> ScanRow {
    let column = &table.columns[index];
    let fitted: Vec<&School> = table
        .schools
        .iter()
        .filter(|school| {
            school.outcome.is_some() && school.weight > 0.0 && !school.features[index].is_missing()
        })
        .collect();
    let y: Array1<f64> = fitted.iter().filter_map(|school| school.outcome).collect();
    let w: Array1<f64> = fitted.iter().map(|school| school.weight).collect();

    let mut row = ScanRow {
        predictor: column.name.clone(),
        kind: column.kind,
        n: fitted.len(),
        p_value: None,
        direction: Direction::NotApplicable,
        statistic: None,
        summary: None,
        levels: None,
        note: None,
    };

    let outcome: Result<(), RegressionError> = match column.kind {
        FeatureKind::Numeric => {
            let present: Array1<f64> = table
                .schools
                .iter()
                .filter_map(|school| school.features[index].as_numeric())
                .collect();
            row.summary = regression::describe(present.view());

            let x: Array1<f64> = fitted
                .iter()
                .filter_map(|school| school.features[index].as_numeric())
                .collect();
            regression::weighted_linear_fit(x.view(), y.view(), w.view()).map(|fit| {
                row.p_value = Some(fit.p_value);
                row.statistic = Some(fit.slope);
                row.direction = match fit.slope.partial_cmp(&0.0) {
                    Some(Ordering::Greater) => Direction::Positive,
                    Some(Ordering::Less) => Direction::Negative,
                    _ => Direction::Flat,
                };
            })
        }
        FeatureKind::Categorical => {
            let levels: Vec<&str> = fitted
                .iter()
                .filter_map(|school| school.features[index].as_category())
                .collect();
            regression::weighted_anova(&levels, y.view(), w.view()).map(|fit| {
                row.p_value = Some(fit.p_value);
                row.statistic = Some(fit.f_statistic);
                row.levels = Some(fit.levels);
            })
        }
    };

    if let Err(err) = outcome {
        log::warn!("No p-value for '{}': {err}", column.name);
        row.note = Some(err.to_string());
    }
    row
}
