pub mod codec;
pub mod config;
pub mod error;

pub use codec::{FixedCodec, FixedWidth, FnCodec, ItemCodec, SharedCodec};
pub use config::EngineConfig;
pub use error::{Error, Result};
