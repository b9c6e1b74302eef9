use faer::Mat;
use rand::Rng;

use crate::{dram::DramError, math, settings::RunConfiguration};

/// Adaptive multivariate normal proposal.
///
/// Stage `k` of a delayed rejection step draws from
/// `N(current, (scale * shrink_k)^2 * covariance)`, where `shrink_0 = 1`
/// and `shrink_k` is the product of the first `k` shrink factors.
#[derive(Debug, Clone)]
pub struct Proposal {
    covariance: Mat<f64>,
    factor: Mat<f64>,
    log_det: f64,
    scale: f64,
    stage_scales: Vec<f64>,
}

impl Proposal {
    pub fn new(settings: &RunConfiguration) -> Result<Self, DramError> {
        let dim = settings.dimension;
        let covariance = match &settings.proposal.start_covariance {
            Some(values) => math::mat_from_row_major(dim, values),
            None => Mat::identity(dim, dim),
        };
        let factor = math::cholesky(&covariance).ok_or_else(|| {
            DramError::Configuration("start covariance is not positive-definite".into())
        })?;

        let mut stage_scales = vec![1f64];
        for shrink in settings.delayed_rejection_factors() {
            let last = *stage_scales.last().expect("at least one stage");
            stage_scales.push(last * shrink);
        }

        Ok(Self {
            log_det: math::log_det_from_cholesky(&factor),
            covariance,
            factor,
            scale: settings.scale_factor(),
            stage_scales,
        })
    }

    pub fn dim(&self) -> usize {
        self.covariance.nrows()
    }

    /// Number of stages, the first-stage proposal included.
    pub fn num_stages(&self) -> usize {
        self.stage_scales.len()
    }

    pub fn covariance(&self) -> &Mat<f64> {
        &self.covariance
    }

    pub(crate) fn log_det(&self) -> f64 {
        self.log_det
    }

    /// The standard deviation multiplier of a stage.
    pub fn stage_scale(&self, stage: usize) -> f64 {
        self.scale * self.stage_scales[stage]
    }

    /// Draw a candidate for `stage` centered at `center` into `out`.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        center: &[f64],
        stage: usize,
        out: &mut [f64],
    ) {
        math::correlated_gaussian(rng, &self.factor, self.stage_scale(stage), center, out);
    }

    /// Log proposal density of moving from `from` to `to` at `stage`, up
    /// to a constant that only depends on the stage.
    pub fn log_kernel(&self, stage: usize, from: &[f64], to: &[f64]) -> f64 {
        let diff: Vec<f64> = to.iter().zip(from).map(|(t, f)| t - f).collect();
        let scale = self.stage_scale(stage);
        -0.5 * math::mahalanobis_sq(&self.factor, &diff) / (scale * scale)
    }

    /// Replace the covariance. `factor` must be its lower Cholesky factor.
    pub(crate) fn set_covariance(&mut self, covariance: Mat<f64>, factor: Mat<f64>) {
        self.log_det = math::log_det_from_cholesky(&factor);
        self.covariance = covariance;
        self.factor = factor;
    }
}
