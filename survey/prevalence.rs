//! Outcome aggregation: per-cluster incident rates and per-arm prevalence with
//! cluster-bootstrap intervals.

use crate::bootstrap::{BootstrapError, ClusterBootstrap, Interval, Tally};
use crate::config::{Arm, BootstrapSettings};
use crate::data::RespondentTable;
use crate::reconcile::ReconciledCount;

/// The outcome summary of one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOutcome {
    pub cluster: String,
    pub arm: Arm,
    pub respondents: usize,
    pub tally: Tally,
    /// Mean reconciled count among respondents with information.
    pub mean_count: Option<f64>,
}

impl ClusterOutcome {
    /// Fraction of answering respondents reporting an incident; undefined
    /// when nobody in the cluster answered.
    pub fn rate(&self) -> Option<f64> {
        self.tally.ratio()
    }
}

/// Prevalence estimate for a group of clusters.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmSummary {
    /// `None` for the pooled summary over both arms.
    pub arm: Option<Arm>,
    pub clusters: usize,
    pub respondents: usize,
    pub tally: Tally,
    pub interval: Option<Interval>,
    /// Repetitions excluded because their denominator was zero.
    pub undefined_replicates: usize,
}

impl ArmSummary {
    pub fn label(&self) -> &'static str {
        self.arm.map(Arm::label).unwrap_or("all")
    }

    pub fn prevalence(&self) -> Option<f64> {
        self.tally.ratio()
    }
}

/// Tallies reconciled counts.
pub fn tally<'a>(counts: impl IntoIterator<Item = &'a ReconciledCount>) -> Tally {
    let mut tally = Tally::default();
    for count in counts {
        if let Some(count) = count.count() {
            tally.answered += 1;
            if count > 0 {
                tally.positive += 1;
            }
        }
    }
    tally
}

/// One row per cluster, clusters in natural order.
///
/// # Panics
/// If `counts` does not hold one entry per respondent.
pub fn cluster_outcomes(table: &RespondentTable, counts: &[ReconciledCount]) -> Vec<ClusterOutcome> {
    assert_eq!(counts.len(), table.len(), "one reconciled count per respondent");
    table
        .clusters()
        .into_iter()
        .map(|(cluster, members)| {
            let member_counts: Vec<ReconciledCount> =
                members.iter().map(|&index| counts[index]).collect();
            let answered: Vec<f64> = member_counts
                .iter()
                .filter_map(|count| count.count())
                .map(f64::from)
                .collect();
            let mean_count =
                (!answered.is_empty()).then(|| answered.iter().sum::<f64>() / answered.len() as f64);
            ClusterOutcome {
                cluster: cluster.to_string(),
                arm: table.respondents[members[0]].arm,
                respondents: members.len(),
                tally: tally(&member_counts),
                mean_count,
            }
        })
        .collect()
}

/// Pooled and per-arm prevalence, each with a bootstrap interval that
/// resamples only the clusters of that group. The groups share one base seed,
/// offset by a fixed stream number per group.
pub fn summarize_by_arm(
    table: &RespondentTable,
    counts: &[ReconciledCount],
    settings: &BootstrapSettings,
) -> Result<Vec<ArmSummary>, BootstrapError> {
    assert_eq!(counts.len(), table.len(), "one reconciled count per respondent");
    let clusters = table.clusters();
    let groups = [None, Some(Arm::Treatment), Some(Arm::Control)];
    let base_seed = settings.resolve_seed();

    let mut summaries = Vec::with_capacity(groups.len());
    for (stream, arm) in groups.into_iter().enumerate() {
        let selected: Vec<(String, Vec<ReconciledCount>)> = clusters
            .iter()
            .filter(|(_, members)| {
                arm.is_none_or(|arm| table.respondents[members[0]].arm == arm)
            })
            .map(|(cluster, members)| {
                (
                    cluster.to_string(),
                    members.iter().map(|&index| counts[index]).collect(),
                )
            })
            .collect();
        if selected.is_empty() {
            log::warn!(
                "No clusters in the {} arm; skipping its summary",
                arm.map(Arm::label).unwrap_or("pooled")
            );
            continue;
        }

        let respondents = selected.iter().map(|(_, members)| members.len()).sum();
        let bootstrap = ClusterBootstrap::new(selected)?;
        let group_settings = BootstrapSettings {
            seed: Some(base_seed.wrapping_add(stream as u64)),
            ..*settings
        };
        let distribution = bootstrap.run(&group_settings)?;

        summaries.push(ArmSummary {
            arm,
            clusters: bootstrap.cluster_count(),
            respondents,
            tally: bootstrap.observed(),
            interval: distribution.interval(),
            undefined_replicates: distribution.undefined,
        });
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::Response;
    use crate::data::{Respondent, RespondentSchema};
    use crate::reconcile::ReconciledCount::{Count, NoInformation};
    use approx::assert_abs_diff_eq;

    fn respondent(cluster: &str, arm: Arm) -> Respondent {
        Respondent {
            id: String::new(),
            cluster: cluster.into(),
            arm,
            responses: vec![Response::Missing],
        }
    }

    fn table() -> RespondentTable {
        let schema = RespondentSchema {
            items: vec!["x".into()],
            itemized: vec![0],
            lifetime: [0, 0],
            balance: vec![],
        };
        let respondents = vec![
            respondent("S2", Arm::Control),
            respondent("S1", Arm::Treatment),
            respondent("S1", Arm::Treatment),
            respondent("S2", Arm::Control),
            respondent("S3", Arm::Treatment),
        ];
        RespondentTable {
            schema,
            respondents,
        }
    }

    #[test]
    fn cluster_rates_use_answered_respondents_only() {
        let counts = [Count(0), Count(2), NoInformation, Count(1), NoInformation];
        let outcomes = cluster_outcomes(&table(), &counts);
        assert_eq!(outcomes.len(), 3);

        assert_eq!(outcomes[0].cluster, "S1");
        assert_eq!(outcomes[0].respondents, 2);
        assert_eq!(outcomes[0].tally, Tally { positive: 1, answered: 1 });
        assert_eq!(outcomes[0].rate(), Some(1.0));
        assert_eq!(outcomes[0].mean_count, Some(2.0));

        assert_eq!(outcomes[1].cluster, "S2");
        assert_eq!(outcomes[1].arm, Arm::Control);
        assert_abs_diff_eq!(outcomes[1].rate().unwrap(), 0.5);
        assert_abs_diff_eq!(outcomes[1].mean_count.unwrap(), 0.5);

        // Nobody in S3 answered: the rate is undefined, not NaN or zero.
        assert_eq!(outcomes[2].rate(), None);
        assert_eq!(outcomes[2].mean_count, None);
    }

    #[test]
    fn arm_summaries_split_clusters_by_assignment() {
        let counts = [Count(0), Count(2), Count(0), Count(1), Count(0)];
        let settings = BootstrapSettings {
            replicates: 200,
            seed: Some(11),
            confidence: 0.9,
        };
        let summaries = summarize_by_arm(&table(), &counts, &settings).unwrap();
        assert_eq!(summaries.len(), 3);

        assert_eq!(summaries[0].label(), "all");
        assert_eq!(summaries[0].clusters, 3);
        assert_eq!(summaries[0].respondents, 5);
        assert_eq!(summaries[0].tally, Tally { positive: 2, answered: 5 });

        assert_eq!(summaries[1].label(), "treatment");
        assert_eq!(summaries[1].clusters, 2);
        assert_eq!(summaries[1].tally, Tally { positive: 1, answered: 3 });

        assert_eq!(summaries[2].label(), "control");
        assert_eq!(summaries[2].tally, Tally { positive: 1, answered: 2 });
        let interval = summaries[2].interval.unwrap();
        assert!(interval.lower >= 0.0 && interval.upper <= 1.0);

        let again = summarize_by_arm(&table(), &counts, &settings).unwrap();
        assert_eq!(summaries, again);
    }

    #[test]
    fn tally_skips_no_information() {
        let result = tally(&[Count(3), NoInformation, Count(0)]);
        assert_eq!(result, Tally { positive: 1, answered: 2 });
    }
}
