mod core;
mod memory;
mod text;

pub use self::core::{ChainFiles, ChainStart, ChainStorage, StorageConfig};
pub use memory::{MemoryChainStorage, MemoryConfig};
pub use text::{TextChainStorage, TextConfig};
