use faer::{Col, ColRef, Mat, Scale};
use log::{debug, warn};

use crate::{
    dram::DramError,
    math,
    proposal::Proposal,
    settings::{AdaptationSettings, RunConfiguration},
};

/// Weighted running mean and covariance.
///
/// Uses West's incremental update, so adding a point with weight `w`
/// is equivalent to adding it `w` times.
#[derive(Debug, Clone)]
pub struct RunningCovariance {
    dim: usize,
    weight: f64,
    distinct: u64,
    mean: Col<f64>,
    comoment: Mat<f64>,
}

impl RunningCovariance {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            weight: 0.,
            distinct: 0,
            mean: Col::zeros(dim),
            comoment: Mat::zeros(dim, dim),
        }
    }

    pub fn add_sample(&mut self, point: &[f64], weight: f64) {
        assert!(point.len() == self.dim);
        if weight <= 0. {
            return;
        }
        self.weight += weight;
        self.distinct += 1;
        let ratio = weight / self.weight;
        let point = ColRef::from_slice(point);
        let delta = point - &self.mean;
        self.mean += Scale(ratio) * &delta;
        let after = point - &self.mean;
        self.comoment += Scale(weight) * (&after * delta.transpose());
    }

    /// Add a point that repeats the previous one. Only the weights change.
    pub fn repeat_last(&mut self, point: &[f64]) {
        let distinct = self.distinct;
        self.add_sample(point, 1.);
        self.distinct = distinct;
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Number of `add_sample` calls that were not repetitions.
    pub fn distinct(&self) -> u64 {
        self.distinct
    }

    pub fn mean(&self) -> ColRef<'_, f64> {
        self.mean.as_ref()
    }

    /// Unbiased covariance estimate, treating weights as frequencies.
    pub fn covariance(&self) -> Option<Mat<f64>> {
        if self.weight <= 1. {
            return None;
        }
        let n = self.dim;
        let denom = self.weight - 1.;
        Some(Mat::from_fn(n, n, |i, j| {
            // average both triangles to keep the result exactly symmetric
            0.5 * (self.comoment[(i, j)] + self.comoment[(j, i)]) / denom
        }))
    }
}

/// What happened during a covariance update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdaptEvent {
    /// The covariance was replaced. `measure` is the Hellinger distance
    /// between the old and new proposal.
    Updated { measure: f64, regularization: f64 },
    /// The new covariance could not be made positive-definite and the
    /// previous one was kept.
    Fallback,
}

/// Periodically replaces the proposal covariance by the empirical
/// covariance of the chain history.
#[derive(Debug, Clone)]
pub struct CovarianceAdaptation {
    settings: AdaptationSettings,
    period: u64,
    history: RunningCovariance,
    updates: u64,
    fallbacks: u64,
    chain: u64,
}

impl CovarianceAdaptation {
    pub fn new(settings: &RunConfiguration, chain: u64) -> Self {
        Self {
            settings: settings.adaptation,
            period: settings.update_period(),
            history: RunningCovariance::new(settings.dimension),
            updates: 0,
            fallbacks: 0,
            chain,
        }
    }

    /// Record the state of the chain after a step.
    pub fn register(&mut self, point: &[f64], accepted: bool) {
        if accepted || self.history.weight() == 0. {
            self.history.add_sample(point, 1.);
        } else {
            self.history.repeat_last(point);
        }
    }

    /// Record a run-length encoded sample, used when resuming a chain.
    pub fn register_weighted(&mut self, point: &[f64], weight: u64) {
        self.history.add_sample(point, weight as f64);
    }

    /// Rebuild the adaptation from a run-length encoded history of `steps`
    /// steps and refresh the proposal.
    ///
    /// The number of past updates is reconstructed from the number of
    /// completed adaptation periods.
    pub fn restore<'a, I>(&mut self, rows: I, steps: u64, proposal: &mut Proposal)
    where
        I: IntoIterator<Item = (&'a [f64], u64)>,
    {
        for (point, weight) in rows {
            self.register_weighted(point, weight);
        }
        if steps < self.period {
            return;
        }
        let periods = steps / self.period;
        self.updates = periods.min(self.settings.update_count).saturating_sub(1);
        self.update(proposal);
    }

    pub fn history(&self) -> &RunningCovariance {
        &self.history
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }

    pub fn is_frozen(&self) -> bool {
        self.updates >= self.settings.update_count
    }

    /// Update the proposal if `step` completes an adaptation period.
    pub fn adapt(&mut self, step: u64, proposal: &mut Proposal) -> Option<AdaptEvent> {
        if step == 0 || step % self.period != 0 {
            return None;
        }
        self.update(proposal)
    }

    /// Update the proposal from the current history.
    ///
    /// Nothing happens until the history holds more distinct points than
    /// dimensions, or once the update budget is used up.
    pub fn update(&mut self, proposal: &mut Proposal) -> Option<AdaptEvent> {
        if self.is_frozen() || self.history.distinct() <= self.history.dim as u64 {
            return None;
        }
        let Some(estimate) = self.history.covariance() else {
            return None;
        };

        match self.regularize(estimate) {
            Ok((covariance, factor, regularization)) => {
                let measure = hellinger_distance(proposal, &covariance, &factor);
                proposal.set_covariance(covariance, factor);
                self.updates += 1;
                debug!(
                    "chain {}: covariance update {} (measure {:.3e}, regularization {:.1e})",
                    self.chain, self.updates, measure, regularization
                );
                Some(AdaptEvent::Updated {
                    measure,
                    regularization,
                })
            }
            Err(err) => {
                self.fallbacks += 1;
                warn!(
                    "chain {}: keeping previous proposal covariance: {}",
                    self.chain, err
                );
                Some(AdaptEvent::Fallback)
            }
        }
    }

    /// Add `epsilon * I` to `estimate`, growing epsilon until a Cholesky
    /// factorization succeeds.
    fn regularize(&self, estimate: Mat<f64>) -> Result<(Mat<f64>, Mat<f64>, f64), DramError> {
        if !math::mat_all_finite(&estimate) {
            return Err(DramError::Numerical(
                "empirical covariance contains non-finite values".into(),
            ));
        }
        let n = estimate.nrows();
        let mean_var = (0..n).map(|i| estimate[(i, i)].abs()).sum::<f64>() / n as f64;
        let mut epsilon = self.settings.regularization;
        for _ in 0..=self.settings.max_regularization_attempts {
            let mut candidate = estimate.clone();
            for i in 0..n {
                candidate[(i, i)] += epsilon;
            }
            if let Some(factor) = math::cholesky(&candidate) {
                return Ok((candidate, factor, epsilon));
            }
            epsilon = if epsilon == 0. {
                f64::EPSILON * mean_var.max(1.)
            } else {
                epsilon * 10.
            };
        }
        Err(DramError::Numerical(format!(
            "covariance is not positive-definite after regularization up to {:e}",
            epsilon / 10.
        )))
    }
}

/// Hellinger distance between `N(0, old)` and `N(0, new)`, where `old` is
/// the current proposal covariance.
fn hellinger_distance(old: &Proposal, new: &Mat<f64>, new_factor: &Mat<f64>) -> f64 {
    let n = new.nrows();
    let average = Mat::from_fn(n, n, |i, j| 0.5 * (old.covariance()[(i, j)] + new[(i, j)]));
    let Some(average_factor) = math::cholesky(&average) else {
        return 1.;
    };
    let log_bc = 0.25 * (old.log_det() + math::log_det_from_cholesky(new_factor))
        - 0.5 * math::log_det_from_cholesky(&average_factor);
    let squared = 1. - log_bc.exp();
    squared.max(0.).sqrt()
}
