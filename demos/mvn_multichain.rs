//! Sample a correlated 4-dimensional normal distribution with four
//! parallel DRAM chains and write the chains to `./out/`.
//!
//! Run with `RUST_LOG=info cargo run --release --example mvn_multichain`.

use anyhow::Result;
use dram_rs::{
    run, LogDensity, LogpError, OutputSettings, ParallelizationModel, RunConfiguration, StartPoint,
};
use faer::{linalg::triangular_solve::solve_lower_triangular_in_place, Mat, Par, Side};
use thiserror::Error;

const NDIM: usize = 4;
const MEAN: [f64; NDIM] = [-10., 15., 20., 0.];
const COVMAT: [[f64; NDIM]; NDIM] = [
    [1.0, 0.45, -0.3, 0.0],
    [0.45, 1.0, 0.3, -0.2],
    [-0.3, 0.3, 1.0, 0.6],
    [0.0, -0.2, 0.6, 1.0],
];

#[derive(Error, Debug)]
enum MvnError {}

impl LogpError for MvnError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

struct Mvn {
    factor: Mat<f64>,
    log_norm: f64,
}

impl Mvn {
    fn new() -> Result<Self> {
        let cov = Mat::from_fn(NDIM, NDIM, |i, j| COVMAT[i][j]);
        let factor = cov
            .llt(Side::Lower)
            .map_err(|err| anyhow::anyhow!("covariance is not positive definite: {:?}", err))?
            .L()
            .to_owned();
        let log_det: f64 = (0..NDIM).map(|i| 2. * factor[(i, i)].ln()).sum();
        let log_norm = -0.5 * (NDIM as f64 * (2. * std::f64::consts::PI).ln() + log_det);
        Ok(Self { factor, log_norm })
    }
}

impl LogDensity for Mvn {
    type LogpError = MvnError;

    fn dim(&self) -> Option<usize> {
        Some(NDIM)
    }

    fn logp(&self, point: &[f64]) -> Result<f64, MvnError> {
        let mut z = Mat::from_fn(NDIM, 1, |i, _| point[i] - MEAN[i]);
        solve_lower_triangular_in_place(self.factor.as_ref(), z.as_mut(), Par::Seq);
        Ok(self.log_norm - 0.5 * z.as_ref().squared_norm_l2())
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let mut settings = RunConfiguration::new(NDIM);
    settings.seed = 3751;
    settings.chain_size = 30_000;
    settings.progress_report_period = 20_000;
    settings.parallelization = ParallelizationModel::MultiChain;
    settings.num_chains = 4;
    settings.start_point = StartPoint::Random {
        lower: vec![-25.; NDIM],
        upper: vec![25.; NDIM],
    };
    settings.output = Some(OutputSettings {
        overwrite_requested: true,
        ..OutputSettings::new("./out/mvn_parallel_multiChain")
    });

    let result = run(NDIM, Mvn::new()?, settings)?;

    for summary in result.summaries() {
        println!(
            "chain {}: {} with {} unique points in {} steps, acceptance rate {:.3}, ess {:.0}",
            summary.chain + 1,
            summary.status,
            summary.unique_points,
            summary.steps,
            summary.acceptance_rate,
            summary.effective_sample_size,
        );
        println!("  mean {:?}", summary.mean);
    }
    if let Some(rhat) = &result.rhat {
        println!("split R-hat: {:?}", rhat);
    }
    for files in result.files() {
        println!("wrote {}", files.chain.display());
    }
    Ok(())
}
