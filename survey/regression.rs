//! # Weighted Univariate Fits
//!
//! Closed-form weighted least squares for a single predictor, and its
//! categorical counterpart, the weighted one-way ANOVA (the same model written
//! with level dummies). Tail probabilities come from `statrs`.
//!
//! These fits answer a screening question only: does one predictor, on its
//! own, track the outcome across schools? They are not adjusted for anything.

use ndarray::{Array1, ArrayView1, Zip};
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegressionError {
    #[error("Input lengths differ: {x} predictor values, {y} outcomes, {w} weights.")]
    LengthMismatch { x: usize, y: usize, w: usize },
    #[error("Only {found} observations are available; at least {required} are required.")]
    TooFewObservations { found: usize, required: usize },
    #[error("The predictor has the same value for every observation.")]
    ZeroVariance,
    #[error("The predictor has a single level.")]
    SingleLevel,
    #[error("The outcome is constant, so no association can be measured.")]
    ConstantOutcome,
    #[error("Weights must be finite and strictly positive.")]
    InvalidWeight,
    #[error("Inputs contain NaN or infinite values.")]
    NonFinite,
    #[error("Distribution error: {0}")]
    Distribution(String),
}

/// Weighted simple regression `y ~ 1 + x`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearFit {
    pub n: usize,
    pub intercept: f64,
    pub slope: f64,
    pub slope_se: f64,
    pub t_statistic: f64,
    pub df: f64,
    /// Two-sided p-value of the slope.
    pub p_value: f64,
}

/// Weighted one-way ANOVA of `y` across predictor levels.
#[derive(Debug, Clone, PartialEq)]
pub struct AnovaFit {
    pub n: usize,
    pub levels: usize,
    pub f_statistic: f64,
    pub df_between: f64,
    pub df_within: f64,
    pub p_value: f64,
}

/// Location and spread of a numeric sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Describe {
    pub n: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample standard deviation (n - 1 denominator); undefined below two values.
    pub std_dev: Option<f64>,
}

/// Summary statistics, `None` for an empty sample.
pub fn describe(values: ArrayView1<f64>) -> Option<Describe> {
    let mean = values.mean()?;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(Describe {
        n: values.len(),
        mean,
        min,
        max,
        std_dev: (values.len() >= 2).then(|| values.std(1.0)),
    })
}

fn validate(
    x_len: usize,
    y: ArrayView1<f64>,
    w: ArrayView1<f64>,
    required: usize,
) -> Result<(), RegressionError> {
    if x_len != y.len() || x_len != w.len() {
        return Err(RegressionError::LengthMismatch {
            x: x_len,
            y: y.len(),
            w: w.len(),
        });
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(RegressionError::NonFinite);
    }
    if w.iter().any(|&v| !v.is_finite() || v <= 0.0) {
        return Err(RegressionError::InvalidWeight);
    }
    if x_len < required {
        return Err(RegressionError::TooFewObservations {
            found: x_len,
            required,
        });
    }
    let first = y[0];
    if y.iter().all(|&v| v == first) {
        return Err(RegressionError::ConstantOutcome);
    }
    Ok(())
}

/// Fits `y ~ 1 + x` by weighted least squares and tests the slope.
pub fn weighted_linear_fit(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    w: ArrayView1<f64>,
) -> Result<LinearFit, RegressionError> {
    validate(x.len(), y, w, 3)?;
    if x.iter().any(|v| !v.is_finite()) {
        return Err(RegressionError::NonFinite);
    }
    let first = x[0];
    if x.iter().all(|&v| v == first) {
        return Err(RegressionError::ZeroVariance);
    }

    let sum_w = w.sum();
    let x_bar = w.dot(&x) / sum_w;
    let y_bar = w.dot(&y) / sum_w;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    Zip::from(&x).and(&y).and(&w).for_each(|&xi, &yi, &wi| {
        sxx += wi * (xi - x_bar) * (xi - x_bar);
        sxy += wi * (xi - x_bar) * (yi - y_bar);
    });
    if sxx <= 0.0 {
        return Err(RegressionError::ZeroVariance);
    }

    let slope = sxy / sxx;
    let intercept = y_bar - slope * x_bar;
    let residuals: Array1<f64> = Zip::from(&x)
        .and(&y)
        .map_collect(|&xi, &yi| yi - intercept - slope * xi);
    let rss = Zip::from(&residuals)
        .and(&w)
        .fold(0.0, |acc, &r, &wi| acc + wi * r * r);

    let n = x.len();
    let df = (n - 2) as f64;
    let slope_se = (rss / df / sxx).sqrt();

    let (t_statistic, p_value) = if slope_se > 0.0 {
        let t = slope / slope_se;
        (t, two_sided_t_p_value(t, df)?)
    } else if slope != 0.0 {
        // Exact fit: every point lies on the line.
        (slope.signum() * f64::INFINITY, 0.0)
    } else {
        return Err(RegressionError::ConstantOutcome);
    };

    Ok(LinearFit {
        n,
        intercept,
        slope,
        slope_se,
        t_statistic,
        df,
        p_value,
    })
}

/// Weighted one-way ANOVA: F-test that the weighted outcome mean is the same
/// in every level.
pub fn weighted_anova<S: AsRef<str>>(
    levels: &[S],
    y: ArrayView1<f64>,
    w: ArrayView1<f64>,
) -> Result<AnovaFit, RegressionError> {
    validate(levels.len(), y, w, 2)?;

    // (sum of weights, weighted sum of y) per level
    let mut groups: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for ((level, &yi), &wi) in levels.iter().zip(y.iter()).zip(w.iter()) {
        let entry = groups.entry(level.as_ref()).or_insert((0.0, 0.0));
        entry.0 += wi;
        entry.1 += wi * yi;
    }
    let k = groups.len();
    if k < 2 {
        return Err(RegressionError::SingleLevel);
    }
    let n = levels.len();
    if n <= k {
        return Err(RegressionError::TooFewObservations {
            found: n,
            required: k + 1,
        });
    }

    let grand_mean = w.dot(&y) / w.sum();
    let ss_between: f64 = groups
        .values()
        .map(|&(weight, sum)| {
            let mean = sum / weight;
            weight * (mean - grand_mean) * (mean - grand_mean)
        })
        .sum();
    let ss_within: f64 = levels
        .iter()
        .zip(y.iter())
        .zip(w.iter())
        .map(|((level, &yi), &wi)| {
            let (weight, sum) = groups[level.as_ref()];
            let deviation = yi - sum / weight;
            wi * deviation * deviation
        })
        .sum();

    let df_between = (k - 1) as f64;
    let df_within = (n - k) as f64;
    let (f_statistic, p_value) = if ss_within > 0.0 {
        let f = (ss_between / df_between) / (ss_within / df_within);
        (f, f_p_value(f, df_between, df_within)?)
    } else if ss_between > 0.0 {
        (f64::INFINITY, 0.0)
    } else {
        return Err(RegressionError::ConstantOutcome);
    };

    Ok(AnovaFit {
        n,
        levels: k,
        f_statistic,
        df_between,
        df_within,
        p_value,
    })
}

/// Two-sided tail probability of Student's t.
pub fn two_sided_t_p_value(t: f64, df: f64) -> Result<f64, RegressionError> {
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| RegressionError::Distribution(e.to_string()))?;
    Ok((2.0 * dist.sf(t.abs())).min(1.0))
}

/// Upper tail probability of the F distribution.
pub fn f_p_value(f: f64, df_between: f64, df_within: f64) -> Result<f64, RegressionError> {
    let dist = FisherSnedecor::new(df_between, df_within)
        .map_err(|e| RegressionError::Distribution(e.to_string()))?;
    Ok(dist.sf(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn unweighted_fit_matches_ordinary_least_squares() {
        let x = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let y = array![2.1, 3.9, 6.2, 7.8, 10.1];
        let w = Array1::<f64>::ones(5);
        let fit = weighted_linear_fit(x.view(), y.view(), w.view()).unwrap();
        // Reference values computed with an OLS fit of the same data.
        assert_abs_diff_eq!(fit.slope, 1.99, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.intercept, 0.05, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.df, 3.0);
        assert!(fit.p_value < 1e-3);
        assert!(fit.t_statistic > 0.0);
    }

    #[test]
    fn integer_weights_act_like_repeated_rows_for_the_slope() {
        let x = array![0.0, 1.0, 2.0, 3.0];
        let y = array![1.0, 0.0, 3.0, 2.0];
        let w = array![2.0, 1.0, 1.0, 3.0];
        let fit = weighted_linear_fit(x.view(), y.view(), w.view()).unwrap();

        let expanded_x = array![0.0, 0.0, 1.0, 2.0, 3.0, 3.0, 3.0];
        let expanded_y = array![1.0, 1.0, 0.0, 3.0, 2.0, 2.0, 2.0];
        let ones = Array1::<f64>::ones(7);
        let expanded =
            weighted_linear_fit(expanded_x.view(), expanded_y.view(), ones.view()).unwrap();
        assert_abs_diff_eq!(fit.slope, expanded.slope, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.intercept, expanded.intercept, epsilon = 1e-12);
    }

    #[test]
    fn negative_association_has_negative_slope() {
        let x = array![10.0, 20.0, 30.0, 40.0];
        let y = array![0.5, 0.42, 0.31, 0.2];
        let w = array![30.0, 25.0, 40.0, 35.0];
        let fit = weighted_linear_fit(x.view(), y.view(), w.view()).unwrap();
        assert!(fit.slope < 0.0);
        assert!(fit.p_value > 0.0 && fit.p_value < 0.05);
    }

    #[test]
    fn zero_variance_predictor_is_reported() {
        let x = array![3.0, 3.0, 3.0, 3.0];
        let y = array![0.1, 0.2, 0.3, 0.4];
        let w = Array1::<f64>::ones(4);
        assert_eq!(
            weighted_linear_fit(x.view(), y.view(), w.view()),
            Err(RegressionError::ZeroVariance)
        );
    }

    #[test]
    fn exact_fit_has_zero_p_value() {
        let x = array![1.0, 2.0, 3.0];
        let y = array![2.0, 4.0, 6.0];
        let w = Array1::<f64>::ones(3);
        let fit = weighted_linear_fit(x.view(), y.view(), w.view()).unwrap();
        assert_eq!(fit.p_value, 0.0);
        assert_eq!(fit.t_statistic, f64::INFINITY);
    }

    #[test]
    fn degenerate_inputs_are_errors() {
        let x = array![1.0, 2.0];
        let y = array![0.2, 0.4];
        let w = Array1::<f64>::ones(2);
        assert_eq!(
            weighted_linear_fit(x.view(), y.view(), w.view()),
            Err(RegressionError::TooFewObservations {
                found: 2,
                required: 3
            })
        );
        let x = array![1.0, 2.0, 3.0];
        let y = array![0.2, 0.2, 0.2];
        assert_eq!(
            weighted_linear_fit(x.view(), y.view(), Array1::<f64>::ones(3).view()),
            Err(RegressionError::ConstantOutcome)
        );
        assert_eq!(
            weighted_linear_fit(x.view(), y.view(), array![1.0, 0.0, 1.0].view()),
            Err(RegressionError::InvalidWeight)
        );
        assert!(matches!(
            weighted_linear_fit(x.view(), y.view(), Array1::<f64>::ones(2).view()),
            Err(RegressionError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn anova_detects_separated_levels() {
        let levels = ["urban", "urban", "urban", "rural", "rural", "rural"];
        let y = array![0.10, 0.12, 0.11, 0.40, 0.42, 0.39];
        let w = Array1::<f64>::ones(6);
        let fit = weighted_anova(&levels, y.view(), w.view()).unwrap();
        assert_eq!(fit.levels, 2);
        assert_abs_diff_eq!(fit.df_between, 1.0);
        assert_abs_diff_eq!(fit.df_within, 4.0);
        assert!(fit.p_value < 1e-4);
    }

    #[test]
    fn two_level_anova_agrees_with_dummy_regression() {
        let levels = ["a", "b", "a", "b", "a"];
        let dummy = array![0.0, 1.0, 0.0, 1.0, 0.0];
        let y = array![0.3, 0.5, 0.2, 0.6, 0.35];
        let w = array![10.0, 12.0, 8.0, 15.0, 9.0];
        let anova = weighted_anova(&levels, y.view(), w.view()).unwrap();
        let linear = weighted_linear_fit(dummy.view(), y.view(), w.view()).unwrap();
        assert_abs_diff_eq!(anova.f_statistic, linear.t_statistic.powi(2), epsilon = 1e-9);
        assert_abs_diff_eq!(anova.p_value, linear.p_value, epsilon = 1e-6);
    }

    #[test]
    fn single_level_anova_is_degenerate() {
        let levels = ["x", "x", "x"];
        let y = array![0.1, 0.2, 0.3];
        assert_eq!(
            weighted_anova(&levels, y.view(), Array1::<f64>::ones(3).view()),
            Err(RegressionError::SingleLevel)
        );
    }

    #[test]
    fn describe_reports_sample_moments() {
        let values = array![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let summary = describe(values.view()).unwrap();
        assert_eq!(summary.n, 8);
        assert_abs_diff_eq!(summary.mean, 5.0);
        assert_abs_diff_eq!(summary.min, 2.0);
        assert_abs_diff_eq!(summary.max, 9.0);
        assert_abs_diff_eq!(summary.std_dev.unwrap(), (32.0_f64 / 7.0).sqrt(), epsilon = 1e-12);
        assert_eq!(describe(array![1.5].view()).unwrap().std_dev, None);
        assert!(describe(Array1::<f64>::zeros(0).view()).is_none());
    }

    #[test]
    fn t_tail_probability_is_symmetric() {
        let left = two_sided_t_p_value(-2.0, 10.0).unwrap();
        let right = two_sided_t_p_value(2.0, 10.0).unwrap();
        assert_abs_diff_eq!(left, right);
        assert_abs_diff_eq!(two_sided_t_p_value(0.0, 5.0).unwrap(), 1.0, epsilon = 1e-12);
    }
}
