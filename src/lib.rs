//! Sample from unnormalized log-densities with parallel Delayed Rejection
//! Adaptive Metropolis (DRAM) chains.
//!
//! Each chain proposes from a multivariate normal whose covariance is
//! learned from the chain's own history, and retries rejected proposals
//! with shrunken proposals before giving up. Chains run in parallel on a
//! thread pool and store their states as run-length encoded rows, either
//! in memory or in plain-text files that can be resumed.
//!
//! ```no_run
//! use dram_rs::{run, LogDensityFn, RunConfiguration};
//!
//! let density = LogDensityFn::new(2, |x: &[f64]| -0.5 * (x[0] * x[0] + x[1] * x[1]));
//! let mut settings = RunConfiguration::new(2);
//! settings.chain_size = 10_000;
//! settings.seed = 42;
//!
//! let result = run(2, density, settings).unwrap();
//! for summary in result.summaries() {
//!     println!("chain {}: mean {:?}", summary.chain, summary.mean);
//! }
//! ```

pub(crate) mod adapt;
pub(crate) mod chain;
pub(crate) mod diagnostics;
pub(crate) mod dram;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod proposal;
pub(crate) mod sampler;
pub(crate) mod settings;
pub(crate) mod storage;

pub use adapt::{AdaptEvent, CovarianceAdaptation, RunningCovariance};
pub use chain::{draw_start_point, Chain, ChainState, DramChain, Progress, SampleRecord};
pub use diagnostics::{
    burnin_location, effective_sample_size, expanded_columns, integrated_autocorrelation_time,
    mean_and_covariance, refine, split_rhat, ChainStatus, ChainSummary,
};
pub use dram::{DramError, StepOutcome};
pub use model::{LogDensity, LogDensityFn, LogpError, NonFiniteLogp};
pub use proposal::Proposal;
pub use sampler::{
    run, sample_sequentially, ChainOutput, ChainProgress, ProgressCallback, RunResult, Sampler,
    SamplerWaitResult, Trace,
};
pub use settings::{
    AdaptationSettings, DelayedRejectionSettings, DomainBounds, OutputSettings,
    ParallelizationModel, ProposalSettings, RunConfiguration, StartPoint,
};
pub use storage::{
    ChainFiles, ChainStart, ChainStorage, MemoryChainStorage, MemoryConfig, StorageConfig,
    TextChainStorage, TextConfig,
};
