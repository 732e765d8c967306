//! # Response Normalization
//!
//! Survey exports mark non-answers with reserved raw codes. This module turns a
//! raw cell into a [`Response`], a tagged variant that keeps the three
//! non-answer categories apart from each other and from every valid count.
//!
//! Codes are matched per item: a [`Codebook`] lists the raw strings that mean
//! missing, refused, or don't-know. Sentinel codes are matched before a cell is
//! parsed as a count, so an item may reserve a non-negative code such as `98`.
//! Anything that is neither a listed code nor a non-negative integer is an
//! error; unknown codes are never coerced.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single normalized survey answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Response {
    /// A valid non-negative count or indicator.
    Valid(u32),
    /// No answer recorded, including an absent or empty cell.
    Missing,
    /// The respondent declined to answer.
    Refused,
    /// The respondent answered "don't know".
    DontKnow,
}

/// Signed code written for [`Response::Missing`] in tabular output.
pub const MISSING_CODE: i64 = -1;
/// Signed code written for [`Response::Refused`] in tabular output.
pub const REFUSED_CODE: i64 = -2;
/// Signed code written for [`Response::DontKnow`] in tabular output.
pub const DONT_KNOW_CODE: i64 = -3;

impl Response {
    /// The count carried by a valid answer.
    pub fn valid(self) -> Option<u32> {
        match self {
            Response::Valid(count) => Some(count),
            _ => None,
        }
    }

    pub fn is_valid(self) -> bool {
        matches!(self, Response::Valid(_))
    }

    /// Signed representation: valid counts are non-negative, each non-answer
    /// category has its own negative code.
    pub fn encode(self) -> i64 {
        match self {
            Response::Valid(count) => i64::from(count),
            Response::Missing => MISSING_CODE,
            Response::Refused => REFUSED_CODE,
            Response::DontKnow => DONT_KNOW_CODE,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Valid(count) => write!(f, "{count}"),
            Response::Missing => f.write_str("missing"),
            Response::Refused => f.write_str("refused"),
            Response::DontKnow => f.write_str("dont_know"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    #[error(
        "Unrecognized raw value '{0}': it is not a non-negative integer and is not listed as a missing, refused, or don't-know code."
    )]
    Unrecognized(String),
    #[error("Raw value '{0}' is a count too large to represent.")]
    OutOfRange(String),
    #[error("Raw code '{code}' is listed as both {first} and {second}.")]
    Collision {
        code: String,
        first: &'static str,
        second: &'static str,
    },
}

/// The raw codes that mark each non-answer category for one survey item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Codebook {
    pub missing: Vec<String>,
    pub refused: Vec<String>,
    pub dont_know: Vec<String>,
}

impl Default for Codebook {
    fn default() -> Self {
        Self {
            missing: vec!["NA".into(), "-99".into()],
            refused: vec!["-98".into()],
            dont_know: vec!["-97".into()],
        }
    }
}

impl Codebook {
    /// Fails if one raw code is assigned to more than one category.
    pub fn validate(&self) -> Result<(), CodeError> {
        let categories: [(&'static str, &[String]); 3] = [
            ("missing", &self.missing),
            ("refused", &self.refused),
            ("dont_know", &self.dont_know),
        ];
        for (i, &(first, codes)) in categories.iter().enumerate() {
            for &(second, others) in categories.iter().skip(i + 1) {
                if let Some(code) = codes.iter().find(|code| {
                    others
                        .iter()
                        .any(|other| codes_match(code.as_str(), other.as_str()))
                }) {
                    return Err(CodeError::Collision {
                        code: code.clone(),
                        first,
                        second,
                    });
                }
            }
        }
        Ok(())
    }

    fn category_of(&self, raw: &str) -> Option<Response> {
        let listed = |codes: &[String]| codes.iter().any(|code| codes_match(code.as_str(), raw));
        if listed(self.missing.as_slice()) {
            Some(Response::Missing)
        } else if listed(self.refused.as_slice()) {
            Some(Response::Refused)
        } else if listed(self.dont_know.as_slice()) {
            Some(Response::DontKnow)
        } else {
            None
        }
    }
}

/// Two codes match when their trimmed text is equal or when both parse to the
/// same number, so `98` and `98.0` are the same code.
fn codes_match(code: &str, raw: &str) -> bool {
    let code = code.trim();
    let raw = raw.trim();
    if code == raw {
        return true;
    }
    match (code.parse::<f64>(), raw.parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Normalizes one raw survey cell against the item's codebook.
pub fn normalize(raw: Option<&str>, codebook: &Codebook) -> Result<Response, CodeError> {
    let Some(raw) = raw.map(str::trim) else {
        return Ok(Response::Missing);
    };
    if raw.is_empty() {
        return Ok(Response::Missing);
    }
    if let Some(category) = codebook.category_of(raw) {
        return Ok(category);
    }
    parse_count(raw)
}

fn parse_count(raw: &str) -> Result<Response, CodeError> {
    if let Ok(value) = raw.parse::<u64>() {
        return u32::try_from(value)
            .map(Response::Valid)
            .map_err(|_| CodeError::OutOfRange(raw.to_string()));
    }
    // Exports frequently write integer answers as "2.0".
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 && value.fract() == 0.0 => {
            if value > f64::from(u32::MAX) {
                Err(CodeError::OutOfRange(raw.to_string()))
            } else {
                Ok(Response::Valid(value as u32))
            }
        }
        _ => Err(CodeError::Unrecognized(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> Codebook {
        Codebook {
            missing: vec!["NA".into()],
            refused: vec!["98".into()],
            dont_know: vec!["99".into(), "dk".into()],
        }
    }

    #[test]
    fn valid_counts_pass_through_unchanged() {
        assert_eq!(normalize(Some("0"), &book()), Ok(Response::Valid(0)));
        assert_eq!(normalize(Some(" 7 "), &book()), Ok(Response::Valid(7)));
        assert_eq!(normalize(Some("3.0"), &book()), Ok(Response::Valid(3)));
    }

    #[test]
    fn absent_and_empty_cells_are_missing() {
        assert_eq!(normalize(None, &book()), Ok(Response::Missing));
        assert_eq!(normalize(Some(""), &book()), Ok(Response::Missing));
        assert_eq!(normalize(Some("   "), &book()), Ok(Response::Missing));
        assert_eq!(normalize(Some("NA"), &book()), Ok(Response::Missing));
    }

    #[test]
    fn listed_codes_take_precedence_over_counts() {
        assert_eq!(normalize(Some("98"), &book()), Ok(Response::Refused));
        assert_eq!(normalize(Some("98.0"), &book()), Ok(Response::Refused));
        assert_eq!(normalize(Some("99"), &book()), Ok(Response::DontKnow));
        assert_eq!(normalize(Some("dk"), &book()), Ok(Response::DontKnow));
    }

    #[test]
    fn unknown_codes_fail_loudly() {
        assert_eq!(
            normalize(Some("-5"), &book()),
            Err(CodeError::Unrecognized("-5".into()))
        );
        assert_eq!(
            normalize(Some("1.5"), &book()),
            Err(CodeError::Unrecognized("1.5".into()))
        );
        assert_eq!(
            normalize(Some("yes"), &book()),
            Err(CodeError::Unrecognized("yes".into()))
        );
    }

    #[test]
    fn default_codebook_uses_negative_codes() {
        let defaults = Codebook::default();
        assert_eq!(normalize(Some("-99"), &defaults), Ok(Response::Missing));
        assert_eq!(normalize(Some("-98"), &defaults), Ok(Response::Refused));
        assert_eq!(normalize(Some("-97"), &defaults), Ok(Response::DontKnow));
        assert_eq!(normalize(Some("98"), &defaults), Ok(Response::Valid(98)));
        assert!(defaults.validate().is_ok());
    }

    #[test]
    fn colliding_codes_are_rejected() {
        let bad = Codebook {
            missing: vec!["9".into()],
            refused: vec!["9.0".into()],
            dont_know: vec![],
        };
        match bad.validate() {
            Err(CodeError::Collision { first, second, .. }) => {
                assert_eq!(first, "missing");
                assert_eq!(second, "refused");
            }
            other => panic!("expected collision, got {other:?}"),
        }
    }

    #[test]
    fn signed_encoding_keeps_categories_disjoint() {
        let all = [
            Response::Missing,
            Response::Refused,
            Response::DontKnow,
            Response::Valid(0),
        ];
        let codes: Vec<i64> = all.iter().map(|r| r.encode()).collect();
        assert_eq!(codes, vec![-1, -2, -3, 0]);
        assert_eq!(Response::Valid(12).encode(), 12);
    }
}
