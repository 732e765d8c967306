//! Baseline balance between trial arms.
//!
//! For every configured covariate, and for the reconciled incident count, the
//! table compares the valid answers of treatment and control respondents:
//! per-arm means and standard deviations, the standardized mean difference
//! with pooled SD `sqrt((sd_t^2 + sd_c^2) / 2)`, and a Welch two-sample t-test.
//! The test treats respondents as independent and ignores clustering, so its
//! p-value is descriptive.

use crate::config::Arm;
use crate::data::RespondentTable;
use crate::reconcile::ReconciledCount;
use crate::regression::{describe, two_sided_t_p_value};
use ndarray::Array1;
use std::collections::BTreeSet;

/// Row label used for the reconciled incident count.
pub const RECONCILED_COUNT_LABEL: &str = "reconciled_count";

/// Valid-answer moments of one covariate within one arm.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ArmMoments {
    pub n: usize,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
}

impl ArmMoments {
    fn from_values(values: Vec<f64>) -> Self {
        match describe(Array1::from_vec(values).view()) {
            Some(summary) => Self {
                n: summary.n,
                mean: Some(summary.mean),
                std_dev: summary.std_dev,
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRow {
    pub covariate: String,
    pub treatment: ArmMoments,
    pub control: ArmMoments,
    /// Treatment mean minus control mean.
    pub difference: Option<f64>,
    pub standardized_difference: Option<f64>,
    pub p_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceTable {
    pub treatment_clusters: usize,
    pub control_clusters: usize,
    pub treatment_respondents: usize,
    pub control_respondents: usize,
    pub rows: Vec<BalanceRow>,
}

/// Compares two samples of valid answers.
pub fn compare(covariate: &str, treated: Vec<f64>, control: Vec<f64>) -> BalanceRow {
    let treatment = ArmMoments::from_values(treated);
    let control = ArmMoments::from_values(control);

    let difference = match (treatment.mean, control.mean) {
        (Some(t), Some(c)) => Some(t - c),
        _ => None,
    };

    let (standardized_difference, p_value) = match (
        difference,
        treatment.std_dev,
        control.std_dev,
    ) {
        (Some(diff), Some(sd_t), Some(sd_c)) => {
            let pooled = ((sd_t * sd_t + sd_c * sd_c) / 2.0).sqrt();
            let smd = (pooled > 0.0).then(|| diff / pooled);
            (smd, welch_p_value(diff, &treatment, &control))
        }
        _ => (None, None),
    };

    BalanceRow {
        covariate: covariate.to_string(),
        treatment,
        control,
        difference,
        standardized_difference,
        p_value,
    }
}

fn welch_p_value(difference: f64, treatment: &ArmMoments, control: &ArmMoments) -> Option<f64> {
    let var_t = treatment.std_dev?.powi(2) / treatment.n as f64;
    let var_c = control.std_dev?.powi(2) / control.n as f64;
    let se = (var_t + var_c).sqrt();
    if se <= 0.0 {
        return None;
    }
    let df = (var_t + var_c).powi(2)
        / (var_t.powi(2) / (treatment.n - 1) as f64 + var_c.powi(2) / (control.n - 1) as f64);
    match two_sided_t_p_value(difference / se, df) {
        Ok(p) => Some(p),
        Err(err) => {
            log::warn!("Welch test failed: {err}");
            None
        }
    }
}

/// Builds the balance table for the configured covariates.
///
/// # Panics
/// If `counts` does not hold one entry per respondent.
pub fn balance_table(table: &RespondentTable, counts: &[ReconciledCount]) -> BalanceTable {
    assert_eq!(counts.len(), table.len(), "one reconciled count per respondent");

    let split = |value: &dyn Fn(usize) -> Option<f64>| {
        let mut treated = Vec::new();
        let mut control = Vec::new();
        for (index, respondent) in table.respondents.iter().enumerate() {
            if let Some(v) = value(index) {
                match respondent.arm {
                    Arm::Treatment => treated.push(v),
                    Arm::Control => control.push(v),
                }
            }
        }
        (treated, control)
    };

    let mut rows: Vec<BalanceRow> = table
        .schema
        .balance
        .iter()
        .map(|&item| {
            let (treated, control) = split(&|index| {
                table.respondents[index].responses[item]
                    .valid()
                    .map(f64::from)
            });
            compare(&table.schema.items[item], treated, control)
        })
        .collect();

    let (treated, control) = split(&|index| counts[index].count().map(f64::from));
    rows.push(compare(RECONCILED_COUNT_LABEL, treated, control));

    let clusters_in = |arm: Arm| {
        table
            .respondents
            .iter()
            .filter(|respondent| respondent.arm == arm)
            .map(|respondent| respondent.cluster.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    };
    let respondents_in =
        |arm: Arm| table.respondents.iter().filter(|r| r.arm == arm).count();

    BalanceTable {
        treatment_clusters: clusters_in(Arm::Treatment),
        control_clusters: clusters_in(Arm::Control),
        treatment_respondents: respondents_in(Arm::Treatment),
        control_respondents: respondents_in(Arm::Control),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::Response;
    use crate::data::{Respondent, RespondentSchema};
    use approx::assert_abs_diff_eq;

    #[test]
    fn standardized_difference_uses_pooled_sd() {
        let row = compare("age", vec![12.0, 14.0, 16.0], vec![11.0, 12.0, 13.0]);
        assert_eq!(row.treatment.n, 3);
        assert_abs_diff_eq!(row.treatment.mean.unwrap(), 14.0);
        assert_abs_diff_eq!(row.control.mean.unwrap(), 12.0);
        assert_abs_diff_eq!(row.difference.unwrap(), 2.0);
        // sd_t = 2, sd_c = 1, pooled = sqrt(2.5)
        assert_abs_diff_eq!(
            row.standardized_difference.unwrap(),
            2.0 / 2.5_f64.sqrt(),
            epsilon = 1e-12
        );
        let p = row.p_value.unwrap();
        assert!(p > 0.0 && p < 1.0);
    }

    #[test]
    fn degenerate_groups_are_undefined() {
        let row = compare("grade", vec![7.0], vec![7.0, 8.0]);
        assert_eq!(row.treatment.std_dev, None);
        assert_eq!(row.difference, Some(-0.5));
        assert_eq!(row.standardized_difference, None);
        assert_eq!(row.p_value, None);

        let constant = compare("grade", vec![7.0, 7.0], vec![7.0, 7.0]);
        assert_eq!(constant.standardized_difference, None);
        assert_eq!(constant.p_value, None);

        let empty = compare("grade", vec![], vec![1.0, 2.0]);
        assert_eq!(empty.treatment, ArmMoments::default());
        assert_eq!(empty.difference, None);
    }

    #[test]
    fn table_splits_valid_answers_by_arm() {
        let schema = RespondentSchema {
            items: vec!["life".into(), "age".into()],
            itemized: vec![0],
            lifetime: [0, 0],
            balance: vec![1],
        };
        let person = |cluster: &str, arm: Arm, age: Response| Respondent {
            id: String::new(),
            cluster: cluster.into(),
            arm,
            responses: vec![Response::Valid(0), age],
        };
        let table = RespondentTable {
            schema,
            respondents: vec![
                person("S1", Arm::Treatment, Response::Valid(13)),
                person("S1", Arm::Treatment, Response::Valid(15)),
                person("S3", Arm::Treatment, Response::Refused),
                person("S2", Arm::Control, Response::Valid(14)),
                person("S2", Arm::Control, Response::Valid(12)),
            ],
        };
        let counts = [
            ReconciledCount::Count(1),
            ReconciledCount::Count(0),
            ReconciledCount::NoInformation,
            ReconciledCount::Count(2),
            ReconciledCount::Count(0),
        ];
        let balance = balance_table(&table, &counts);
        assert_eq!(balance.treatment_clusters, 2);
        assert_eq!(balance.control_clusters, 1);
        assert_eq!(balance.treatment_respondents, 3);
        assert_eq!(balance.control_respondents, 2);
        assert_eq!(balance.rows.len(), 2);

        let age = &balance.rows[0];
        assert_eq!(age.covariate, "age");
        assert_eq!(age.treatment.n, 2);
        assert_abs_diff_eq!(age.difference.unwrap(), 1.0);

        let count = &balance.rows[1];
        assert_eq!(count.covariate, RECONCILED_COUNT_LABEL);
        assert_eq!(count.treatment.n, 2);
        assert_abs_diff_eq!(count.treatment.mean.unwrap(), 0.5);
        assert_abs_diff_eq!(count.control.mean.unwrap(), 1.0);
    }
}
