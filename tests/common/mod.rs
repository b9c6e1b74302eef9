#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use dram_rs::{LogDensity, LogpError};
use faer::{linalg::triangular_solve::solve_lower_triangular_in_place, Mat, Par, Side};
use thiserror::Error;

pub const MEAN: [f64; 4] = [-10., 15., 20., 0.];
pub const COVMAT: [[f64; 4]; 4] = [
    [1.0, 0.45, -0.3, 0.0],
    [0.45, 1.0, 0.3, -0.2],
    [-0.3, 0.3, 1.0, 0.6],
    [0.0, -0.2, 0.6, 1.0],
];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Error, Debug)]
pub enum MvnError {}

impl LogpError for MvnError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

/// The unnormalized log-density of a multivariate normal distribution.
#[derive(Clone)]
pub struct MvnLogp {
    mean: Vec<f64>,
    factor: Mat<f64>,
    calls: Arc<AtomicUsize>,
}

impl MvnLogp {
    pub fn new(mean: &[f64], cov: &[[f64; 4]; 4]) -> Self {
        let n = mean.len();
        let cov = Mat::from_fn(n, n, |i, j| cov[i][j]);
        let factor = cov
            .llt(Side::Lower)
            .expect("covariance is positive definite")
            .L()
            .to_owned();
        Self {
            mean: mean.to_vec(),
            factor,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn example() -> Self {
        Self::new(&MEAN, &COVMAT)
    }

    /// Number of evaluations of this density and all its clones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl LogDensity for MvnLogp {
    type LogpError = MvnError;

    fn dim(&self) -> Option<usize> {
        Some(self.mean.len())
    }

    fn logp(&self, point: &[f64]) -> Result<f64, MvnError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut z = Mat::from_fn(point.len(), 1, |i, _| point[i] - self.mean[i]);
        solve_lower_triangular_in_place(self.factor.as_ref(), z.as_mut(), Par::Seq);
        Ok(-0.5 * z.as_ref().squared_norm_l2())
    }
}

/// Number of data rows in a chain file.
pub fn data_rows(text: &str) -> Vec<&str> {
    text.lines()
        .skip_while(|line| line.starts_with('#'))
        .skip(1)
        .collect()
}
