use std::path::PathBuf;

use anyhow::Result;

use crate::{chain::SampleRecord, diagnostics::ChainSummary, settings::RunConfiguration};

/// Paths of the files written for one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFiles {
    pub chain: PathBuf,
    pub report: PathBuf,
    /// Only present if a refined sample was written.
    pub sample: Option<PathBuf>,
}

/// How a chain begins, depending on what the storage already holds.
pub enum ChainStart<S> {
    /// Start sampling from scratch.
    Fresh(S),
    /// Continue a chain from stored compact rows. The last row has not
    /// been closed yet and is still part of `records`.
    Resume { storage: S, records: Vec<SampleRecord> },
    /// The stored chain is already complete, nothing needs to be sampled.
    Complete {
        records: Vec<SampleRecord>,
        files: Option<ChainFiles>,
    },
}

/// Trait for persisting the compact rows of a single chain.
///
/// Rows are handed over once they are final, that is once the chain has
/// moved on to a different point, or when the chain stops.
pub trait ChainStorage: Send {
    /// Appends a finished row to the storage buffer.
    fn record_sample(&mut self, record: &SampleRecord) -> Result<()>;

    /// Write buffered rows to their destination.
    ///
    /// A failed flush can be retried without duplicating rows.
    fn flush(&mut self) -> std::io::Result<()>;

    /// Write the chain report and the refined sample, and return the
    /// paths of all files of this chain.
    ///
    /// `refined` holds indices into `records`.
    fn finalize(
        self,
        summary: &ChainSummary,
        records: &[SampleRecord],
        refined: &[usize],
    ) -> Result<Option<ChainFiles>>;
}

/// Configuration trait for creating storage backends.
///
/// The configuration is shared by all chain threads of a run.
pub trait StorageConfig: Send + Sync + 'static {
    /// The storage type for individual chains.
    type ChainStorage: ChainStorage;

    /// Check existing output before any chain starts.
    fn prepare(&self, settings: &RunConfiguration) -> Result<()>;

    /// Create storage for a single chain.
    fn new_chain(
        &self,
        settings: &RunConfiguration,
        chain: u64,
    ) -> Result<ChainStart<Self::ChainStorage>>;
}
