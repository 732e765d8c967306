//! # Cluster Bootstrap
//!
//! Percentile intervals for a prevalence ratio under a cluster design. Each
//! repetition resamples respondents with replacement inside every cluster,
//! keeping the cluster's size, so within-school correlation is preserved.
//!
//! Numerators and denominators are summed over all clusters before the one
//! division per repetition. A cluster where nobody answered contributes zero
//! to both sums and never divides on its own. A repetition whose total
//! denominator is zero is undefined; it is counted and left out of the
//! percentiles.
//!
//! Repetitions run on the rayon pool. Repetition `r` seeds its own generator
//! from the base seed and `r`, and results are collected in repetition order,
//! so a fixed seed gives identical output on any number of threads.

use crate::config::{BootstrapSettings, SettingsError};
use crate::reconcile::ReconciledCount;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BootstrapError {
    #[error("Cluster '{0}' has no respondents; an empty cluster cannot be resampled.")]
    EmptyCluster(String),
    #[error("No clusters were supplied to the bootstrap.")]
    NoClusters,
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("Draw for cluster '{cluster}' references respondent {index}, but the cluster has {size}.")]
    DrawOutOfRange {
        cluster: String,
        index: usize,
        size: usize,
    },
    #[error("Expected draws for {expected} clusters, got {found}.")]
    DrawCountMismatch { expected: usize, found: usize },
}

/// Numerator and denominator of one resample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
    /// Answered respondents with at least one incident.
    pub positive: usize,
    /// Respondents with a usable answer.
    pub answered: usize,
}

impl Tally {
    /// `positive / answered`, undefined when nobody answered.
    pub fn ratio(self) -> Option<f64> {
        (self.answered > 0).then(|| self.positive as f64 / self.answered as f64)
    }

    fn record(&mut self, outcome: Option<bool>) {
        if let Some(positive) = outcome {
            self.answered += 1;
            if positive {
                self.positive += 1;
            }
        }
    }
}

/// A two-sided percentile interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

struct Cluster {
    label: String,
    /// `None` for respondents without information.
    outcomes: Vec<Option<bool>>,
}

/// Respondents grouped by cluster, ready for resampling.
pub struct ClusterBootstrap {
    clusters: Vec<Cluster>,
}

impl ClusterBootstrap {
    /// Builds the resampling frame. Every cluster must be non-empty.
    pub fn new<I, S>(groups: I) -> Result<Self, BootstrapError>
    where
        I: IntoIterator<Item = (S, Vec<ReconciledCount>)>,
        S: Into<String>,
    {
        let mut clusters = Vec::new();
        for (label, counts) in groups {
            let label = label.into();
            if counts.is_empty() {
                return Err(BootstrapError::EmptyCluster(label));
            }
            clusters.push(Cluster {
                label,
                outcomes: counts.iter().map(|count| count.any_incident()).collect(),
            });
        }
        if clusters.is_empty() {
            return Err(BootstrapError::NoClusters);
        }
        Ok(Self { clusters })
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// The statistic on the original, unresampled data.
    pub fn observed(&self) -> Tally {
        let mut tally = Tally::default();
        for cluster in &self.clusters {
            for &outcome in &cluster.outcomes {
                tally.record(outcome);
            }
        }
        tally
    }

    /// One repetition with random within-cluster draws.
    pub fn resample<R: Rng + ?Sized>(&self, rng: &mut R) -> Tally {
        let mut tally = Tally::default();
        for cluster in &self.clusters {
            let size = cluster.outcomes.len();
            for _ in 0..size {
                tally.record(cluster.outcomes[rng.gen_range(0..size)]);
            }
        }
        tally
    }

    /// One repetition with explicit draws: `draws[c]` lists the respondent
    /// indices taken from cluster `c`, in cluster order.
    pub fn resample_with(&self, draws: &[Vec<usize>]) -> Result<Tally, BootstrapError> {
        if draws.len() != self.clusters.len() {
            return Err(BootstrapError::DrawCountMismatch {
                expected: self.clusters.len(),
                found: draws.len(),
            });
        }
        let mut tally = Tally::default();
        for (cluster, indices) in self.clusters.iter().zip(draws) {
            for &index in indices {
                let outcome = cluster.outcomes.get(index).copied().ok_or_else(|| {
                    BootstrapError::DrawOutOfRange {
                        cluster: cluster.label.clone(),
                        index,
                        size: cluster.outcomes.len(),
                    }
                })?;
                tally.record(outcome);
            }
        }
        Ok(tally)
    }

    /// Runs the full bootstrap.
    pub fn run(&self, settings: &BootstrapSettings) -> Result<BootstrapDistribution, BootstrapError> {
        settings.validate()?;
        let seed = settings.resolve_seed();
        log::debug!(
            "Running {} cluster-bootstrap repetitions over {} clusters (seed {seed})",
            settings.replicates,
            self.clusters.len()
        );

        let tallies: Vec<Tally> = (0..settings.replicates)
            .into_par_iter()
            .map(|replicate| {
                let mut rng = StdRng::seed_from_u64(replicate_seed(seed, replicate as u64));
                self.resample(&mut rng)
            })
            .collect();

        let mut statistics = Vec::with_capacity(tallies.len());
        let mut undefined = 0usize;
        for tally in tallies {
            match tally.ratio() {
                Some(value) => statistics.push(value),
                None => undefined += 1,
            }
        }
        if undefined > 0 {
            log::warn!(
                "{undefined} of {} bootstrap repetitions had no answered respondents and were excluded",
                settings.replicates
            );
        }
        statistics.sort_by(|a, b| a.total_cmp(b));

        Ok(BootstrapDistribution {
            statistics,
            undefined,
            confidence: settings.confidence,
            seed,
        })
    }
}

/// Derives an independent stream seed for one repetition (SplitMix64 finalizer).
fn replicate_seed(seed: u64, replicate: u64) -> u64 {
    let mut z = seed.wrapping_add(replicate.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// The sorted, defined statistics of all repetitions.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapDistribution {
    /// Defined repetition statistics in ascending order.
    pub statistics: Vec<f64>,
    /// Repetitions whose denominator was zero.
    pub undefined: usize,
    pub confidence: f64,
    /// The base seed actually used.
    pub seed: u64,
}

impl BootstrapDistribution {
    /// The `q`-quantile (0..=1) by linear interpolation between order
    /// statistics; `None` when no repetition was defined.
    pub fn percentile(&self, q: f64) -> Option<f64> {
        percentile_sorted(&self.statistics, q)
    }

    /// The percentile interval at the configured confidence level.
    pub fn interval(&self) -> Option<Interval> {
        let tail = (1.0 - self.confidence) / 2.0;
        Some(Interval {
            lower: self.percentile(tail)?,
            upper: self.percentile(1.0 - tail)?,
        })
    }
}

/// Linear-interpolation quantile of an ascending slice.
pub fn percentile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let position = q.clamp(0.0, 1.0) * last as f64;
    let below = position.floor() as usize;
    let above = (below + 1).min(last);
    let fraction = position - below as f64;
    Some(sorted[below] + fraction * (sorted[above] - sorted[below]))
}
