use anyhow::Result;

use crate::{
    chain::SampleRecord,
    diagnostics::ChainSummary,
    settings::RunConfiguration,
    storage::{ChainFiles, ChainStart, ChainStorage, StorageConfig},
};

/// Storage that keeps chains in memory only.
///
/// The sampler always holds the compact rows of a chain, so this backend
/// has nothing to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryConfig {}

#[derive(Debug, Default)]
pub struct MemoryChainStorage {}

impl ChainStorage for MemoryChainStorage {
    fn record_sample(&mut self, _record: &SampleRecord) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn finalize(
        self,
        _summary: &ChainSummary,
        _records: &[SampleRecord],
        _refined: &[usize],
    ) -> Result<Option<ChainFiles>> {
        Ok(None)
    }
}

impl StorageConfig for MemoryConfig {
    type ChainStorage = MemoryChainStorage;

    fn prepare(&self, _settings: &RunConfiguration) -> Result<()> {
        Ok(())
    }

    fn new_chain(
        &self,
        _settings: &RunConfiguration,
        _chain: u64,
    ) -> Result<ChainStart<MemoryChainStorage>> {
        Ok(ChainStart::Fresh(MemoryChainStorage::default()))
    }
}
