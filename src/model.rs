//! Core abstractions for target densities.
//!
//! Provides the `LogDensity` trait which defines the interface for the
//! unnormalized log-density a chain samples from, and `LogDensityFn`, a
//! wrapper that turns a plain closure into a `LogDensity`.

use std::{convert::Infallible, fmt::Debug};

use thiserror::Error;

/// Errors that happen when we evaluate the log-density function
pub trait LogpError: std::error::Error {
    /// Unrecoverable errors during logp computation stop the chain,
    /// recoverable errors are seen as automatic rejections.
    fn is_recoverable(&self) -> bool;
}

impl LogpError for Infallible {
    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Trait for target densities that can be sampled by a DRAM chain.
///
/// The same instance is shared by all chains of a run and is evaluated
/// concurrently, so implementations must not rely on interior mutability
/// for correctness.
pub trait LogDensity: Send + Sync + 'static {
    type LogpError: Debug + Send + Sync + LogpError + 'static;

    /// Compute the unnormalized log probability density at `point`.
    ///
    /// `f64::NEG_INFINITY` marks points outside of the support. NaN or
    /// positive infinity are treated as recoverable evaluation failures.
    fn logp(&self, point: &[f64]) -> Result<f64, Self::LogpError>;

    /// The dimensionality of the domain, if the density knows it.
    fn dim(&self) -> Option<usize> {
        None
    }
}

/// A log-density backed by a closure `Fn(&[f64]) -> f64`.
#[derive(Clone)]
pub struct LogDensityFn<F> {
    dim: usize,
    func: F,
}

impl<F> LogDensityFn<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
{
    pub fn new(dim: usize, func: F) -> Self {
        Self { dim, func }
    }
}

impl<F> LogDensity for LogDensityFn<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
{
    type LogpError = Infallible;

    fn logp(&self, point: &[f64]) -> Result<f64, Infallible> {
        Ok((self.func)(point))
    }

    fn dim(&self) -> Option<usize> {
        Some(self.dim)
    }
}

/// The outcome of one checked log-density evaluation.
#[derive(Debug)]
pub(crate) enum Evaluation<E> {
    /// A finite value or negative infinity.
    Value(f64),
    /// The function returned NaN or positive infinity.
    NonFinite(f64),
    /// The function returned an error it considers recoverable.
    Recoverable(E),
    /// The function returned an error that must stop the chain.
    Fatal(E),
}

/// Error reported when a density returns a value that is neither finite nor -inf.
#[derive(Error, Debug, Clone, Copy)]
#[error("log-density returned an invalid value: {0}")]
pub struct NonFiniteLogp(pub f64);

/// Evaluate `density` at `point` and classify the result.
pub(crate) fn evaluate<D: LogDensity + ?Sized>(
    density: &D,
    point: &[f64],
) -> Evaluation<D::LogpError> {
    match density.logp(point) {
        Ok(value) if value.is_finite() || value == f64::NEG_INFINITY => Evaluation::Value(value),
        Ok(value) => Evaluation::NonFinite(value),
        Err(err) if err.is_recoverable() => Evaluation::Recoverable(err),
        Err(err) => Evaluation::Fatal(err),
    }
}
