//! # Incident Count Reconciliation
//!
//! Self-reports of repeated victimization are often inconsistent: a respondent
//! may describe an incident under one item and then answer `0` to the
//! lifetime question, reading it as "any other incidents". Each respondent
//! therefore gets one reconciled count taken as the maximum over independently
//! aggregated sources:
//!
//! - `itemized_total`: sum of valid answers across every itemized column;
//! - `cross_check_total`: the same sum with the two lifetime columns left out,
//!   which matters when the lifetime columns are listed among the itemized
//!   sources;
//! - each lifetime column on its own, a non-answer counting as zero.
//!
//! This is a counting policy, not an estimator. A respondent who gave
//! affirmative evidence anywhere is never under-counted, and agreeing sources
//! are never added together. A respondent with no valid answer in any of these
//! columns is [`ReconciledCount::NoInformation`], which is never confused with a
//! confirmed zero.

use crate::codes::Response;
use crate::data::{RespondentSchema, RespondentTable};
use std::fmt;

/// Signed code written for [`ReconciledCount::NoInformation`] in tabular output.
/// Disjoint from every response sentinel.
pub const NO_INFORMATION_CODE: i64 = -9;

/// The reconciled incident count of one respondent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconciledCount {
    Count(u32),
    NoInformation,
}

impl ReconciledCount {
    pub fn count(self) -> Option<u32> {
        match self {
            ReconciledCount::Count(count) => Some(count),
            ReconciledCount::NoInformation => None,
        }
    }

    /// Whether any incident was reported; `None` without information.
    pub fn any_incident(self) -> Option<bool> {
        self.count().map(|count| count > 0)
    }

    pub fn encode(self) -> i64 {
        match self {
            ReconciledCount::Count(count) => i64::from(count),
            ReconciledCount::NoInformation => NO_INFORMATION_CODE,
        }
    }
}

impl fmt::Display for ReconciledCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciledCount::Count(count) => write!(f, "{count}"),
            ReconciledCount::NoInformation => f.write_str("NA"),
        }
    }
}

/// The intermediate aggregates behind one reconciled count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub itemized_total: u32,
    pub cross_check_total: u32,
    pub lifetime: [u32; 2],
    pub count: ReconciledCount,
}

/// Applies the max-of-aggregates rule.
///
/// `itemized` holds every itemized answer, `cross_check` the itemized answers
/// that are not lifetime columns, and `lifetime` the two lifetime answers.
pub fn reconcile(
    itemized: &[Response],
    cross_check: &[Response],
    lifetime: [Response; 2],
) -> Reconciliation {
    let sum_valid = |responses: &[Response]| {
        responses
            .iter()
            .filter_map(|response| response.valid())
            .fold(0u32, u32::saturating_add)
    };
    let itemized_total = sum_valid(itemized);
    let cross_check_total = sum_valid(cross_check);
    let lifetime_values = lifetime.map(|response| response.valid().unwrap_or(0));

    let informative = itemized
        .iter()
        .chain(cross_check)
        .chain(lifetime.iter())
        .any(|response| response.is_valid());

    let count = if informative {
        ReconciledCount::Count(
            itemized_total
                .max(cross_check_total)
                .max(lifetime_values[0])
                .max(lifetime_values[1]),
        )
    } else {
        ReconciledCount::NoInformation
    };

    Reconciliation {
        itemized_total,
        cross_check_total,
        lifetime: lifetime_values,
        count,
    }
}

/// Column positions the reconciler reads, resolved from the schema once.
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    width: usize,
    itemized: Vec<usize>,
    cross_check: Vec<usize>,
    lifetime: [usize; 2],
}

impl ReconcilePlan {
    pub fn new(schema: &RespondentSchema) -> Self {
        let cross_check = schema
            .itemized
            .iter()
            .copied()
            .filter(|index| !schema.lifetime.contains(index))
            .collect();
        Self {
            width: schema.items.len(),
            itemized: schema.itemized.clone(),
            cross_check,
            lifetime: schema.lifetime,
        }
    }

    /// Reconciles one respondent's answers.
    ///
    /// # Panics
    /// If `responses` does not have one entry per schema item.
    pub fn apply(&self, responses: &[Response]) -> Reconciliation {
        assert_eq!(
            responses.len(),
            self.width,
            "respondent row does not match the schema width"
        );
        let gather = |indices: &[usize]| -> Vec<Response> {
            indices.iter().map(|&index| responses[index]).collect()
        };
        reconcile(
            &gather(self.itemized.as_slice()),
            &gather(self.cross_check.as_slice()),
            self.lifetime.map(|index| responses[index]),
        )
    }
}

/// Reconciles every respondent in the table, in table order.
pub fn reconcile_table(table: &RespondentTable) -> Vec<Reconciliation> {
    let plan = ReconcilePlan::new(&table.schema);
    let results: Vec<Reconciliation> = table
        .respondents
        .iter()
        .map(|respondent| plan.apply(&respondent.responses))
        .collect();
    let without_information = results
        .iter()
        .filter(|result| result.count == ReconciledCount::NoInformation)
        .count();
    log::info!(
        "Reconciled {} respondents ({} without usable information)",
        results.len(),
        without_information
    );
    results
}
