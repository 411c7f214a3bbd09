#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod array;
pub mod core;
pub mod index;
pub mod stats;
pub mod storage;

pub use crate::array::{AnyArray, ArraySpec, BigList, IndexableArray};
pub use crate::core::{EngineConfig, Error, Result};
pub use crate::index::{Indexer, StorageMode, Transaction};
