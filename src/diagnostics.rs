//! Convergence diagnostics for run-length encoded chains.
//!
//! All functions here are advisory. They summarize finished (or
//! intermediate) chains and never influence sampling.

use std::fmt;

use crate::{adapt::RunningCovariance, chain::SampleRecord};

/// Sokal's window constant for the integrated autocorrelation time.
const SOKAL_WINDOW: f64 = 5.;

/// Largest lag considered when estimating autocorrelation times.
const MAX_LAG: usize = 2000;

/// Final state of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    /// The chain is still sampling.
    Running,
    /// The chain collected the requested number of distinct points.
    Complete,
    /// The chain hit `max_steps` before collecting enough points.
    Capped,
    /// The chain was stopped early by the user or by a fatal IO error in
    /// another chain.
    Incomplete,
    /// The chain stopped because of an error.
    Failed(String),
}

impl ChainStatus {
    /// The value stored in the report file. Chains that can be continued
    /// are reported as incomplete.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Complete => "complete",
            ChainStatus::Failed(_) => "failed",
            ChainStatus::Running | ChainStatus::Capped | ChainStatus::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStatus::Failed(reason) => write!(f, "failed ({})", reason),
            ChainStatus::Capped => write!(f, "incomplete (step limit reached)"),
            status => write!(f, "{}", status.as_str()),
        }
    }
}

/// Summary statistics of one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSummary {
    pub chain: u64,
    pub status: ChainStatus,
    pub steps: u64,
    pub unique_points: u64,
    pub acceptance_rate: f64,
    pub evaluation_failures: u64,
    pub out_of_domain: u64,
    pub adaptive_updates: u64,
    pub numerical_fallbacks: u64,
    /// Index of the first compact row after burn-in.
    pub burnin: usize,
    /// Smallest effective sample size over all variables, after burn-in.
    pub effective_sample_size: f64,
    /// Number of points in the refined sample.
    pub refined_size: usize,
    /// Mean of the post burn-in chain.
    pub mean: Vec<f64>,
    /// Row-major covariance of the post burn-in chain.
    pub covariance: Vec<f64>,
}

impl ChainSummary {
    /// Compute the diagnostic parts of a summary from the compact rows of
    /// a chain. Counters that only the sampler knows are left at zero.
    pub fn from_records(chain: u64, status: ChainStatus, records: &[SampleRecord], dim: usize) -> Self {
        let steps = records.iter().map(|r| r.weight).sum::<u64>().saturating_sub(1);
        let unique_points = records.len() as u64;
        let accepted = unique_points.saturating_sub(1);
        let burnin = burnin_location(records, dim);
        let columns = expanded_columns(records, burnin);
        let effective_sample_size = columns
            .iter()
            .map(|column| effective_sample_size(column))
            .fold(f64::INFINITY, f64::min);
        let (mean, covariance) = mean_and_covariance(&records[burnin.min(records.len())..], dim);
        Self {
            chain,
            status,
            steps,
            unique_points,
            acceptance_rate: if steps == 0 { 0. } else { accepted as f64 / steps as f64 },
            evaluation_failures: 0,
            out_of_domain: 0,
            adaptive_updates: 0,
            numerical_fallbacks: 0,
            burnin,
            effective_sample_size: if effective_sample_size.is_finite() {
                effective_sample_size
            } else {
                0.
            },
            refined_size: 0,
            mean,
            covariance,
        }
    }
}

/// Index of the first compact row whose log-density is within `dim / 2`
/// of the largest log-density of the chain.
pub fn burnin_location(records: &[SampleRecord], dim: usize) -> usize {
    let max_logp = records
        .iter()
        .map(|r| r.logp)
        .fold(f64::NEG_INFINITY, f64::max);
    let threshold = max_logp - dim as f64 / 2.;
    records
        .iter()
        .position(|r| r.logp >= threshold)
        .unwrap_or(0)
}

/// The verbose chain of every variable, starting at compact row `from`.
pub fn expanded_columns(records: &[SampleRecord], from: usize) -> Vec<Vec<f64>> {
    let records = &records[from.min(records.len())..];
    let Some(first) = records.first() else {
        return Vec::new();
    };
    let len = records.iter().map(|r| r.weight as usize).sum();
    let mut columns = vec![Vec::with_capacity(len); first.point.len()];
    for record in records {
        for (column, &value) in columns.iter_mut().zip(record.point.iter()) {
            column.extend(std::iter::repeat(value).take(record.weight as usize));
        }
    }
    columns
}

/// Weighted mean and row-major covariance of a run-length encoded chain.
pub fn mean_and_covariance(records: &[SampleRecord], dim: usize) -> (Vec<f64>, Vec<f64>) {
    let mut acc = RunningCovariance::new(dim);
    for record in records {
        acc.add_sample(&record.point, record.weight as f64);
    }
    let covariance = match acc.covariance() {
        Some(cov) => (0..dim)
            .flat_map(|i| (0..dim).map(move |j| (i, j)))
            .map(|(i, j)| cov[(i, j)])
            .collect(),
        None => vec![f64::NAN; dim * dim],
    };
    (acc.mean().iter().copied().collect(), covariance)
}

/// Integrated autocorrelation time with Sokal's adaptive window.
///
/// The sum over the autocorrelation function stops at the first lag `M`
/// with `M >= 5 tau(M)`, or at a fixed maximal lag. Constant chains have
/// an autocorrelation time of one.
pub fn integrated_autocorrelation_time(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 1.;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let centered: Vec<f64> = values.iter().map(|x| x - mean).collect();
    let var = centered.iter().map(|x| x * x).sum::<f64>() / n as f64;
    if !(var > 1e-300) {
        return 1.;
    }

    let max_lag = (n / 2).min(MAX_LAG);
    let mut tau = 1f64;
    for lag in 1..=max_lag {
        let autocov = centered[..n - lag]
            .iter()
            .zip(&centered[lag..])
            .map(|(a, b)| a * b)
            .sum::<f64>()
            / n as f64;
        tau += 2. * autocov / var;
        if lag as f64 >= SOKAL_WINDOW * tau {
            break;
        }
    }
    tau.max(1.)
}

/// Effective sample size of a single verbose chain.
pub fn effective_sample_size(values: &[f64]) -> f64 {
    values.len() as f64 / integrated_autocorrelation_time(values)
}

/// Split potential scale reduction factor for one variable.
///
/// Every chain is split in half, and all halves are truncated to the
/// shortest one. Returns NaN if there is not enough data.
pub fn split_rhat(chains: &[&[f64]]) -> f64 {
    if chains.is_empty() {
        return f64::NAN;
    }
    let mut halves: Vec<&[f64]> = Vec::with_capacity(2 * chains.len());
    for chain in chains {
        if chain.len() < 4 {
            return f64::NAN;
        }
        let (first, second) = chain.split_at(chain.len() / 2);
        halves.push(first);
        halves.push(second);
    }
    let len = halves.iter().map(|c| c.len()).min().unwrap_or(0);
    let halves: Vec<&[f64]> = halves.iter().map(|c| &c[..len]).collect();

    let m = halves.len() as f64;
    let n = len as f64;
    let means: Vec<f64> = halves.iter().map(|c| c.iter().sum::<f64>() / n).collect();
    let grand_mean = means.iter().sum::<f64>() / m;

    let between = means.iter().map(|mu| (mu - grand_mean).powi(2)).sum::<f64>() * n / (m - 1.);
    let within = halves
        .iter()
        .zip(&means)
        .map(|(c, mu)| c.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / (n - 1.))
        .sum::<f64>()
        / m;
    if within < 1e-30 {
        return f64::NAN;
    }

    let var_plus = (n - 1.) / n * within + between / n;
    (var_plus / within).sqrt()
}

/// Indices of the compact rows that make up the refined sample.
///
/// The verbose chain after burn-in is thinned by the largest integrated
/// autocorrelation time over all variables. Rows with large weights can
/// appear more than once.
pub fn refine(records: &[SampleRecord], burnin: usize) -> Vec<usize> {
    let columns = expanded_columns(records, burnin);
    let stride = columns
        .iter()
        .map(|column| integrated_autocorrelation_time(column))
        .fold(1f64, f64::max)
        .ceil() as u64;

    let mut selected = Vec::new();
    let mut position = 0u64;
    let mut next = 0u64;
    for (index, record) in records.iter().enumerate().skip(burnin) {
        let end = position + record.weight;
        while next < end {
            selected.push(index);
            next += stride;
        }
        position = end;
    }
    selected
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    use super::*;

    fn record(weight: u64, logp: f64, point: &[f64]) -> SampleRecord {
        SampleRecord {
            weight,
            logp,
            stage: 0,
            mean_acceptance_rate: 0.,
            adaptation_measure: 0.,
            point: point.into(),
        }
    }

    #[test]
    fn burnin_finds_first_typical_row() {
        let records = vec![
            record(1, -500., &[10., 10.]),
            record(3, -20., &[3., 3.]),
            record(2, -1.5, &[0.5, 0.]),
            record(1, -0.8, &[0.1, 0.2]),
            record(4, -3., &[1., 1.]),
        ];
        // threshold is -0.8 - 1
        assert_eq!(burnin_location(&records, 2), 2);
        assert_eq!(burnin_location(&[], 2), 0);
    }

    #[test]
    fn expansion_repeats_weighted_rows() {
        let records = vec![record(2, 0., &[1., 5.]), record(1, 0., &[2., 6.]), record(3, 0., &[3., 7.])];
        let columns = expanded_columns(&records, 1);
        assert_eq!(columns, vec![vec![2., 3., 3., 3.], vec![6., 7., 7., 7.]]);
    }

    #[test]
    fn weighted_moments() {
        let records = vec![record(3, 0., &[1.]), record(1, 0., &[5.])];
        let (mean, cov) = mean_and_covariance(&records, 1);
        assert_abs_diff_eq!(mean[0], 2., epsilon = 1e-12);
        // var of [1, 1, 1, 5]
        assert_abs_diff_eq!(cov[0], 4., epsilon = 1e-12);
    }

    #[test]
    fn autocorrelation_of_independent_draws() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let normal = Normal::new(0., 1.).unwrap();
        let draws: Vec<f64> = (0..5000).map(|_| normal.sample(&mut rng)).collect();
        let tau = integrated_autocorrelation_time(&draws);
        assert!(tau < 1.3, "tau of independent draws: {}", tau);
        assert!(effective_sample_size(&draws) > 3500.);
        assert_eq!(integrated_autocorrelation_time(&[1.; 50]), 1.);
    }

    #[test]
    fn autocorrelation_of_ar1_process() {
        // tau of an AR(1) process is (1 + phi) / (1 - phi)
        let phi = 0.8;
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let normal = Normal::new(0., 1.).unwrap();
        let mut x = 0f64;
        let draws: Vec<f64> = (0..100_000)
            .map(|_| {
                x = phi * x + normal.sample(&mut rng);
                x
            })
            .collect();
        let tau = integrated_autocorrelation_time(&draws);
        assert_abs_diff_eq!(tau, 9., epsilon = 1.);
    }

    #[test]
    fn rhat_well_mixed_and_diverged() {
        let normal = Normal::new(0., 1.).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let a: Vec<f64> = (0..500).map(|_| normal.sample(&mut rng)).collect();
        let b: Vec<f64> = (0..500).map(|_| normal.sample(&mut rng)).collect();
        assert!(split_rhat(&[&a, &b]) < 1.05);

        let c: Vec<f64> = (0..100).map(|i| i as f64 * 0.01).collect();
        let d: Vec<f64> = (0..100).map(|i| 100. + i as f64 * 0.01).collect();
        assert!(split_rhat(&[&c, &d]) > 1.5);
        assert!(split_rhat(&[&[1., 2.]]).is_nan());
    }

    #[test]
    fn refinement_respects_weights() {
        // constant chain: autocorrelation time one, every step is kept
        let records = vec![record(1, -9., &[0.]), record(2, 0., &[1.]), record(3, 0., &[1.])];
        assert_eq!(refine(&records, 1), vec![1, 1, 2, 2, 2]);
        assert!(refine(&records, 3).is_empty());
    }

    #[test]
    fn summary_counts_rows() {
        let records = vec![record(1, -2., &[0., 1.]), record(3, -1., &[1., 0.]), record(2, -1.2, &[-1., 0.5])];
        let summary = ChainSummary::from_records(7, ChainStatus::Complete, &records, 2);
        assert_eq!(summary.chain, 7);
        assert_eq!(summary.steps, 5);
        assert_eq!(summary.unique_points, 3);
        assert_abs_diff_eq!(summary.acceptance_rate, 0.4, epsilon = 1e-12);
        assert_eq!(summary.status.as_str(), "complete");
        assert_eq!(summary.mean.len(), 2);
        assert_eq!(summary.covariance.len(), 4);
    }
}
