use std::path::PathBuf;

use crate::{dram::DramError, math};

/// How chains are distributed over the worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelizationModel {
    /// One chain with no parallel workers.
    SingleChain,
    /// Independent chains, each adapting its own proposal.
    #[default]
    MultiChain,
}

/// Box-shaped region of the domain. Points outside are never evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainBounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl DomainBounds {
    pub fn unbounded(dim: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; dim],
            upper: vec![f64::INFINITY; dim],
        }
    }

    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, point: &[f64]) -> bool {
        point
            .iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .all(|(x, (lo, hi))| lo <= x && x <= hi)
    }

    fn validate(&self, dim: usize, name: &str) -> Result<(), DramError> {
        if self.lower.len() != dim || self.upper.len() != dim {
            return Err(DramError::Configuration(format!(
                "{} bounds must have length {}, got {} and {}",
                name,
                dim,
                self.lower.len(),
                self.upper.len()
            )));
        }
        for (i, (lo, hi)) in self.lower.iter().zip(self.upper.iter()).enumerate() {
            if lo.is_nan() || hi.is_nan() || lo >= hi {
                return Err(DramError::Configuration(format!(
                    "{} bounds are malformed in dimension {}: [{}, {}]",
                    name, i, lo, hi
                )));
            }
        }
        Ok(())
    }
}

/// Where each chain starts.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StartPoint {
    /// All chains start at the origin.
    #[default]
    Origin,
    /// All chains start at the same user supplied point.
    Fixed(Vec<f64>),
    /// Each chain draws a uniform random point from this box.
    Random { lower: Vec<f64>, upper: Vec<f64> },
}

/// Settings for the initial proposal distribution
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProposalSettings {
    /// Factor applied to the proposal standard deviation. Defaults to
    /// `2.38 / sqrt(dimension)`.
    pub scale_factor: Option<f64>,
    /// Row-major starting covariance. Defaults to the identity.
    pub start_covariance: Option<Vec<f64>>,
}

/// Settings for covariance adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptationSettings {
    /// Number of steps between covariance updates. Defaults to `4 * dimension`.
    pub update_period: Option<u64>,
    /// Maximum number of covariance updates. The proposal is frozen afterwards.
    pub update_count: u64,
    /// Value added to the diagonal of every new covariance.
    pub regularization: f64,
    /// How often the regularization is increased tenfold before an update
    /// is abandoned.
    pub max_regularization_attempts: u32,
}

impl Default for AdaptationSettings {
    fn default() -> Self {
        Self {
            update_period: None,
            update_count: u64::MAX,
            regularization: 1e-10,
            max_regularization_attempts: 8,
        }
    }
}

/// Settings for delayed rejection
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DelayedRejectionSettings {
    /// Number of additional proposal stages after a first-stage rejection.
    pub count: usize,
    /// Per-stage shrink factors applied to the proposal scale. Each stage
    /// is shrunk relative to the previous one. Defaults to `0.5^(1/dimension)`
    /// for every stage.
    pub scale_factors: Option<Vec<f64>>,
}

/// Settings for the plain-text chain files
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    /// Path prefix. Chain `i` writes `<prefix>_process_<i>_chain.txt`.
    pub file_name: PathBuf,
    /// Replace existing files instead of resuming from them.
    pub overwrite_requested: bool,
    /// Number of rows between flushes of the chain file.
    pub flush_period: u64,
    /// How often a failed write is retried before the run is aborted.
    pub io_retries: u32,
    /// Write a decorrelated sample file after each chain finishes.
    pub refined_sample: bool,
}

impl OutputSettings {
    pub fn new<P: Into<PathBuf>>(file_name: P) -> Self {
        Self {
            file_name: file_name.into(),
            overwrite_requested: false,
            flush_period: 100,
            io_retries: 3,
            refined_sample: true,
        }
    }
}

/// Configuration of a sampler run. Immutable once sampling starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    /// Dimension of the domain of the log-density.
    pub dimension: usize,
    /// Number of independent chains.
    pub num_chains: usize,
    /// Base seed. Chain `i` uses stream `i` of a generator seeded with it.
    pub seed: u64,
    /// Number of distinct accepted points each chain collects.
    pub chain_size: u64,
    /// Upper bound on the number of steps of a single chain.
    pub max_steps: u64,
    /// Number of steps between progress reports of a chain.
    pub progress_report_period: u64,
    pub parallelization: ParallelizationModel,
    /// A chain aborts once more evaluations than this have failed.
    pub max_evaluation_failures: u64,
    pub domain: DomainBounds,
    pub start_point: StartPoint,
    pub proposal: ProposalSettings,
    pub adaptation: AdaptationSettings,
    pub delayed_rejection: DelayedRejectionSettings,
    /// Keep chains in memory only if `None`.
    pub output: Option<OutputSettings>,
    /// Minimum number of expanded draws per chain before R-hat is reported.
    pub diagnostics_min_samples: usize,
}

impl RunConfiguration {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            num_chains: 4,
            seed: 0,
            chain_size: 100_000,
            max_steps: 10_000_000,
            progress_report_period: 1000,
            parallelization: ParallelizationModel::MultiChain,
            max_evaluation_failures: 1000,
            domain: DomainBounds::unbounded(dimension),
            start_point: StartPoint::Origin,
            proposal: ProposalSettings::default(),
            adaptation: AdaptationSettings::default(),
            delayed_rejection: DelayedRejectionSettings::default(),
            output: None,
            diagnostics_min_samples: 100,
        }
    }

    pub fn scale_factor(&self) -> f64 {
        self.proposal
            .scale_factor
            .unwrap_or_else(|| 2.38 / (self.dimension as f64).sqrt())
    }

    pub fn update_period(&self) -> u64 {
        self.adaptation
            .update_period
            .unwrap_or(4 * self.dimension as u64)
    }

    /// The shrink factor of each delayed rejection stage, relative to the
    /// previous stage.
    pub fn delayed_rejection_factors(&self) -> Vec<f64> {
        match &self.delayed_rejection.scale_factors {
            Some(factors) => factors.clone(),
            None => {
                let factor = 0.5f64.powf(1. / self.dimension as f64);
                vec![factor; self.delayed_rejection.count]
            }
        }
    }

    /// Number of chains actually run.
    pub fn chain_count(&self) -> usize {
        match self.parallelization {
            ParallelizationModel::SingleChain => 1,
            ParallelizationModel::MultiChain => self.num_chains,
        }
    }

    pub fn validate(&self) -> Result<(), DramError> {
        let dim = self.dimension;
        let fail = |msg: String| Err(DramError::Configuration(msg));

        if dim == 0 {
            return fail("dimension must be positive".into());
        }
        if self.num_chains == 0 {
            return fail("at least one chain is required".into());
        }
        if self.parallelization == ParallelizationModel::SingleChain && self.num_chains != 1 {
            return fail(format!(
                "the single-chain model runs exactly one chain, got num_chains = {}",
                self.num_chains
            ));
        }
        if self.chain_size == 0 {
            return fail("chain_size must be positive".into());
        }
        if self.max_steps < self.chain_size {
            return fail(format!(
                "max_steps ({}) is smaller than chain_size ({})",
                self.max_steps, self.chain_size
            ));
        }
        if self.progress_report_period == 0 {
            return fail("progress_report_period must be positive".into());
        }
        if self.update_period() == 0 {
            return fail("adaptation update_period must be positive".into());
        }
        if !(self.adaptation.regularization >= 0.) {
            return fail("adaptation regularization must be non-negative".into());
        }

        self.domain.validate(dim, "domain")?;

        match &self.start_point {
            StartPoint::Origin => {
                if !self.domain.contains(&vec![0f64; dim]) {
                    return fail("the origin lies outside of the domain".into());
                }
            }
            StartPoint::Fixed(point) => {
                if point.len() != dim {
                    return fail(format!(
                        "start point must have length {}, got {}",
                        dim,
                        point.len()
                    ));
                }
                if !point.iter().all(|x| x.is_finite()) || !self.domain.contains(point) {
                    return fail("start point lies outside of the domain".into());
                }
            }
            StartPoint::Random { lower, upper } => {
                let bounds = DomainBounds::new(lower.clone(), upper.clone());
                bounds.validate(dim, "random start point")?;
                if !lower.iter().chain(upper.iter()).all(|x| x.is_finite()) {
                    return fail("random start point bounds must be finite".into());
                }
                if !self.domain.contains(lower) || !self.domain.contains(upper) {
                    return fail("random start point bounds exceed the domain".into());
                }
            }
        }

        let scale = self.scale_factor();
        if !(scale.is_finite() && scale > 0.) {
            return fail(format!("scale factor must be positive, got {}", scale));
        }

        if let Some(cov) = &self.proposal.start_covariance {
            if cov.len() != dim * dim {
                return fail(format!(
                    "start covariance must have {} entries, got {}",
                    dim * dim,
                    cov.len()
                ));
            }
            let mat = math::mat_from_row_major(dim, cov);
            if !math::is_symmetric(&mat, 1e-10) || math::cholesky(&mat).is_none() {
                return fail("start covariance is not symmetric positive-definite".into());
            }
        }

        let factors = self.delayed_rejection_factors();
        if factors.len() != self.delayed_rejection.count {
            return fail(format!(
                "expected {} delayed rejection scale factors, got {}",
                self.delayed_rejection.count,
                factors.len()
            ));
        }
        if !factors.iter().all(|f| f.is_finite() && *f > 0.) {
            return fail("delayed rejection scale factors must be positive".into());
        }

        if let Some(output) = &self.output {
            if output.file_name.as_os_str().is_empty() {
                return fail("output file name is empty".into());
            }
            if output.flush_period == 0 {
                return fail("output flush_period must be positive".into());
            }
        }

        Ok(())
    }
}
