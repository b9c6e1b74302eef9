use std::path::PathBuf;

use rand::Rng;
use thiserror::Error;

use crate::{
    math::logsubexp,
    model::{evaluate, Evaluation, LogDensity, NonFiniteLogp},
    proposal::Proposal,
    settings::DomainBounds,
};

#[derive(Error, Debug)]
pub enum DramError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Chain {chain} aborted after {failures} failed logp evaluations")]
    ChainFatal { chain: u64, failures: u64 },
    #[error("Numerical problem: {0}")]
    Numerical(String),
    #[error("Output file {0:?} exists and overwriting was not requested")]
    OutputExists(PathBuf),
    #[error("Could not access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Chain {chain} could not write its output")]
    FatalIo {
        chain: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("Existing output {path:?} does not match the configuration: {reason}")]
    IncompatibleOutput { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, DramError>;

/// States of a single delayed rejection step. The payload is the
/// zero-based proposal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrState {
    Propose(usize),
    Evaluate(usize),
    Accept(usize),
    DelayedRetry(usize),
    Reject,
}

/// A point of the delayed rejection path together with its log-density.
#[derive(Debug, Clone)]
pub(crate) struct PathPoint {
    pub(crate) point: Box<[f64]>,
    pub(crate) logp: f64,
}

/// Result of one delayed rejection step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// The stage that produced the accepted candidate, `None` on rejection.
    pub accepted_stage: Option<usize>,
    /// Log-density of the state after the step.
    pub logp: f64,
    /// Number of calls to the log-density.
    pub evaluations: usize,
    /// Candidates that were skipped because they left the domain.
    pub out_of_domain: usize,
    /// Evaluations that failed recoverably or returned an invalid value.
    pub failures: u64,
}

/// Log acceptance probability of the last point of `path`, given that all
/// intermediate candidates were rejected.
///
/// `path[0]` is the current state and `path[k]` the candidate of stage
/// `k - 1`. All candidates are centered at the current state.
pub(crate) fn log_acceptance(path: &[PathPoint], proposal: &Proposal) -> f64 {
    let n = path.len() - 1;
    assert!(n >= 1);
    let first = &path[0];
    let last = &path[n];
    if last.logp == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }

    let mut log_forward = 0f64;
    let mut log_backward = 0f64;
    let mut reversed: Vec<PathPoint> = Vec::with_capacity(n);
    for k in 1..n {
        let forward = log_acceptance(&path[..=k], proposal);
        log_forward += logsubexp(0., forward);

        reversed.clear();
        reversed.extend(path[n - k..=n].iter().rev().cloned());
        let backward = log_acceptance(&reversed, proposal);
        log_backward += logsubexp(0., backward);
        if log_backward == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
    }

    let mut log_ratio = last.logp - first.logp;
    for k in 1..n {
        log_ratio += proposal.log_kernel(k - 1, &last.point, &path[n - k].point)
            - proposal.log_kernel(k - 1, &first.point, &path[k].point);
    }

    let log_alpha = log_ratio + log_backward - log_forward;
    if log_alpha.is_nan() {
        return f64::NEG_INFINITY;
    }
    log_alpha.min(0.)
}

/// Run one delayed rejection step from `current`.
///
/// On acceptance the new point is written to `next`. Candidates outside of
/// `domain` get a log-density of `-inf` without calling `density`.
pub(crate) fn delayed_rejection_step<D, R>(
    density: &D,
    domain: &DomainBounds,
    proposal: &Proposal,
    rng: &mut R,
    current: &[f64],
    current_logp: f64,
    next: &mut [f64],
) -> Result<StepOutcome>
where
    D: LogDensity + ?Sized,
    R: Rng + ?Sized,
{
    let mut outcome = StepOutcome {
        accepted_stage: None,
        logp: current_logp,
        evaluations: 0,
        out_of_domain: 0,
        failures: 0,
    };
    let mut path = Vec::with_capacity(proposal.num_stages() + 1);
    path.push(PathPoint {
        point: current.into(),
        logp: current_logp,
    });
    let mut candidate = vec![0f64; current.len()];

    let mut state = DrState::Propose(0);
    loop {
        state = match state {
            DrState::Propose(stage) => {
                proposal.propose(rng, current, stage, &mut candidate);
                DrState::Evaluate(stage)
            }
            DrState::Evaluate(stage) => {
                let logp = if domain.contains(&candidate) {
                    outcome.evaluations += 1;
                    match evaluate(density, &candidate) {
                        Evaluation::Value(logp) => logp,
                        Evaluation::NonFinite(_) | Evaluation::Recoverable(_) => {
                            outcome.failures += 1;
                            f64::NEG_INFINITY
                        }
                        Evaluation::Fatal(err) => {
                            return Err(DramError::LogpFailure(Box::new(err)));
                        }
                    }
                } else {
                    outcome.out_of_domain += 1;
                    f64::NEG_INFINITY
                };
                path.push(PathPoint {
                    point: candidate.as_slice().into(),
                    logp,
                });
                let log_alpha = log_acceptance(&path, proposal);
                let draw: f64 = rng.random();
                if draw.ln() < log_alpha {
                    DrState::Accept(stage)
                } else if stage + 1 < proposal.num_stages() {
                    DrState::DelayedRetry(stage)
                } else {
                    DrState::Reject
                }
            }
            DrState::DelayedRetry(stage) => DrState::Propose(stage + 1),
            DrState::Accept(stage) => {
                let accepted = path.last().expect("path contains the candidate");
                next.copy_from_slice(&accepted.point);
                outcome.logp = accepted.logp;
                outcome.accepted_stage = Some(stage);
                return Ok(outcome);
            }
            DrState::Reject => {
                next.copy_from_slice(current);
                return Ok(outcome);
            }
        }
    }
}

/// Evaluate a start point, treating every kind of failure as an error.
pub(crate) fn initial_logp<D: LogDensity + ?Sized>(density: &D, point: &[f64]) -> Result<f64> {
    match evaluate(density, point) {
        Evaluation::Value(logp) if logp.is_finite() => Ok(logp),
        Evaluation::Value(logp) | Evaluation::NonFinite(logp) => {
            Err(DramError::LogpFailure(Box::new(NonFiniteLogp(logp))))
        }
        Evaluation::Recoverable(err) | Evaluation::Fatal(err) => {
            Err(DramError::LogpFailure(Box::new(err)))
        }
    }
}
