use log::warn;
use rand::Rng;

use crate::{
    adapt::{AdaptEvent, CovarianceAdaptation},
    dram::{delayed_rejection_step, initial_logp, DramError, Result},
    model::LogDensity,
    proposal::Proposal,
    settings::{RunConfiguration, StartPoint},
};

/// The current state of a Markov chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    pub point: Box<[f64]>,
    pub logp: f64,
    /// Number of completed steps.
    pub steps: u64,
    /// Number of accepted proposals.
    pub accepted: u64,
}

impl ChainState {
    pub fn acceptance_rate(&self) -> f64 {
        if self.steps == 0 {
            0.
        } else {
            self.accepted as f64 / self.steps as f64
        }
    }
}

/// One row of a run-length encoded chain.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    /// Number of consecutive steps the chain stayed at `point`.
    pub weight: u64,
    pub logp: f64,
    /// Delayed rejection stage that proposed the point.
    pub stage: usize,
    /// Acceptance rate of the chain when the point was accepted.
    pub mean_acceptance_rate: f64,
    /// Hellinger distance of the last proposal update before the point
    /// was accepted, zero if there was none.
    pub adaptation_measure: f64,
    pub point: Box<[f64]>,
}

/// Information about a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub chain: u64,
    pub step: u64,
    pub accepted: bool,
    pub stage: Option<usize>,
    pub evaluations: usize,
    pub logp: f64,
    pub acceptance_rate: f64,
    pub adaptation: Option<AdaptEvent>,
    pub adaptation_measure: f64,
}

/// Draw samples from a target density with a Markov chain.
pub trait Chain {
    /// Initialize the chain at a position. This should be called before
    /// calling step.
    ///
    /// This fails if the log-density is not finite at `position`.
    fn set_position(&mut self, position: &[f64]) -> Result<()>;

    /// Advance the chain by one step.
    fn step(&mut self) -> Result<Progress>;

    /// The dimensionality of the target.
    fn dim(&self) -> usize;

    fn state(&self) -> &ChainState;
}

/// A delayed rejection adaptive Metropolis chain.
pub struct DramChain<'model, D: LogDensity, R: Rng> {
    density: &'model D,
    settings: &'model RunConfiguration,
    proposal: Proposal,
    adaptation: CovarianceAdaptation,
    rng: R,
    state: ChainState,
    next: Box<[f64]>,
    chain: u64,
    failures: u64,
    out_of_domain: u64,
    latest_measure: f64,
    warned: bool,
}

impl<'model, D: LogDensity, R: Rng> DramChain<'model, D, R> {
    pub fn new(
        density: &'model D,
        settings: &'model RunConfiguration,
        rng: R,
        chain: u64,
    ) -> Result<Self> {
        let dim = settings.dimension;
        Ok(Self {
            density,
            settings,
            proposal: Proposal::new(settings)?,
            adaptation: CovarianceAdaptation::new(settings, chain),
            rng,
            state: ChainState {
                point: vec![0f64; dim].into(),
                logp: f64::NEG_INFINITY,
                steps: 0,
                accepted: 0,
            },
            next: vec![0f64; dim].into(),
            chain,
            failures: 0,
            out_of_domain: 0,
            latest_measure: 0.,
            warned: false,
        })
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    pub fn adaptation(&self) -> &CovarianceAdaptation {
        &self.adaptation
    }

    /// Number of failed log-density evaluations so far.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Number of candidates rejected because they left the domain.
    pub fn out_of_domain(&self) -> u64 {
        self.out_of_domain
    }

    pub fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }

    /// Continue a chain from previously stored rows.
    ///
    /// The chain is positioned at the last row, its counters are restored
    /// and the adaptation history is rebuilt from the weighted rows.
    pub fn restore(&mut self, records: &[SampleRecord], rng: R) -> Result<()> {
        let Some(last) = records.last() else {
            return Err(DramError::Configuration(
                "cannot resume a chain without samples".into(),
            ));
        };
        if last.point.len() != self.dim() || !last.logp.is_finite() {
            return Err(DramError::Configuration(
                "stored chain does not end in a valid state".into(),
            ));
        }
        let steps = records.iter().map(|r| r.weight).sum::<u64>() - 1;
        self.state = ChainState {
            point: last.point.clone(),
            logp: last.logp,
            steps,
            accepted: records.len() as u64 - 1,
        };
        self.rng = rng;
        self.adaptation.restore(
            records.iter().map(|r| (&r.point[..], r.weight)),
            steps,
            &mut self.proposal,
        );
        Ok(())
    }

    /// The first row of a chain, describing its start point.
    pub fn start_record(&self) -> SampleRecord {
        SampleRecord {
            weight: 1,
            logp: self.state.logp,
            stage: 0,
            mean_acceptance_rate: 0.,
            adaptation_measure: 0.,
            point: self.state.point.clone(),
        }
    }

    fn count_failures(&mut self, failures: u64) -> Result<()> {
        if failures == 0 {
            return Ok(());
        }
        self.failures += failures;
        let limit = self.settings.max_evaluation_failures;
        if self.failures > limit {
            return Err(DramError::ChainFatal {
                chain: self.chain,
                failures: self.failures,
            });
        }
        if !self.warned && self.failures > limit / 2 {
            self.warned = true;
            warn!(
                "chain {}: {} of at most {} log-density evaluations failed",
                self.chain, self.failures, limit
            );
        }
        Ok(())
    }
}

impl<'model, D: LogDensity, R: Rng> Chain for DramChain<'model, D, R> {
    fn set_position(&mut self, position: &[f64]) -> Result<()> {
        if position.len() != self.dim() {
            return Err(DramError::Configuration(format!(
                "start point has length {}, expected {}",
                position.len(),
                self.dim()
            )));
        }
        let logp = initial_logp(self.density, position)?;
        self.state.point.copy_from_slice(position);
        self.state.logp = logp;
        self.adaptation.register(position, true);
        Ok(())
    }

    fn step(&mut self) -> Result<Progress> {
        let outcome = delayed_rejection_step(
            self.density,
            &self.settings.domain,
            &self.proposal,
            &mut self.rng,
            &self.state.point,
            self.state.logp,
            &mut self.next,
        )?;
        self.out_of_domain += outcome.out_of_domain as u64;
        self.count_failures(outcome.failures)?;

        let accepted = outcome.accepted_stage.is_some();
        self.state.steps += 1;
        if accepted {
            std::mem::swap(&mut self.state.point, &mut self.next);
            self.state.logp = outcome.logp;
            self.state.accepted += 1;
        }

        self.adaptation.register(&self.state.point, accepted);
        let adaptation = self.adaptation.adapt(self.state.steps, &mut self.proposal);
        if let Some(AdaptEvent::Updated { measure, .. }) = adaptation {
            self.latest_measure = measure;
        }
        let adaptation_measure = self.latest_measure;
        if accepted {
            self.latest_measure = 0.;
        }

        Ok(Progress {
            chain: self.chain,
            step: self.state.steps,
            accepted,
            stage: outcome.accepted_stage,
            evaluations: outcome.evaluations,
            logp: self.state.logp,
            acceptance_rate: self.state.acceptance_rate(),
            adaptation,
            adaptation_measure,
        })
    }

    fn dim(&self) -> usize {
        self.settings.dimension
    }

    fn state(&self) -> &ChainState {
        &self.state
    }
}

/// Write a start point for a chain into `out`.
pub fn draw_start_point<R: Rng + ?Sized>(start: &StartPoint, rng: &mut R, out: &mut [f64]) {
    match start {
        StartPoint::Origin => out.fill(0.),
        StartPoint::Fixed(point) => out.copy_from_slice(point),
        StartPoint::Random { lower, upper } => {
            for (x, (lo, hi)) in out.iter_mut().zip(lower.iter().zip(upper.iter())) {
                *x = rng.random_range(*lo..*hi);
            }
        }
    }
}
