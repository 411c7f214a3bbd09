pub mod block_store;
pub mod mmap;
pub mod pressure;

pub use block_store::{BlockStore, BlockStoreStats};
pub use mmap::TempMapping;
pub use pressure::{PressureListener, PressureMonitor};
