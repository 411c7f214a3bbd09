use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

pub const DEFAULT_SEGMENT_LENGTH: usize = 10 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_GUARANTEED_MEMORY: u64 = 1024 * 1024 * 1024;
/// 低于这个值的保证内存没有意义（进程本身就要吃掉这么多）。
pub const MIN_GUARANTEED_MEMORY: u64 = 50 * 1024 * 1024;
pub const DEFAULT_PARALLEL_SORT_THRESHOLD: u64 = 10_000;

/// 引擎配置（可从 TOML 加载，缺省字段取默认值）。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 内存后端每个段的元素个数
    pub segment_length: usize,
    /// BlockStore 块大小（字节）
    pub block_size: usize,
    /// 进程内存超过该值后，压力回调才会请求回收缓存块
    pub guaranteed_memory_bytes: u64,
    pub pressure_poll_interval_ms: u64,
    /// 压力回调抢锁的最长等待
    pub pressure_lock_wait_ms: u64,
    pub initial_list_capacity: u64,
    /// 子区间至少这么长才考虑交给其它 worker
    pub parallel_sort_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            segment_length: DEFAULT_SEGMENT_LENGTH,
            block_size: DEFAULT_BLOCK_SIZE,
            guaranteed_memory_bytes: DEFAULT_GUARANTEED_MEMORY,
            pressure_poll_interval_ms: 1000,
            pressure_lock_wait_ms: 1000,
            initial_list_capacity: 1024,
            parallel_sort_threshold: DEFAULT_PARALLEL_SORT_THRESHOLD,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.segment_length == 0 {
            return Err(Error::Config("segment_length must be at least 1".into()));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be at least 1".into()));
        }
        if self.guaranteed_memory_bytes < MIN_GUARANTEED_MEMORY {
            return Err(Error::Config(format!(
                "guaranteed_memory_bytes must be at least {} (got {})",
                MIN_GUARANTEED_MEMORY, self.guaranteed_memory_bytes
            )));
        }
        if self.pressure_poll_interval_ms == 0 || self.pressure_lock_wait_ms == 0 {
            return Err(Error::Config("pressure intervals must be positive".into()));
        }
        if self.initial_list_capacity == 0 {
            return Err(Error::Config("initial_list_capacity must be at least 1".into()));
        }
        if self.parallel_sort_threshold < 2 {
            return Err(Error::Config("parallel_sort_threshold must be at least 2".into()));
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: EngineConfig = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn pressure_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pressure_poll_interval_ms)
    }

    pub fn pressure_lock_wait(&self) -> Duration {
        Duration::from_millis(self.pressure_lock_wait_ms)
    }
}

static GLOBAL: RwLock<Option<Arc<EngineConfig>>> = parking_lot::const_rwlock(None);

/// 进程级默认配置（未安装时为 `EngineConfig::default()`）。
pub fn global() -> Arc<EngineConfig> {
    if let Some(cfg) = GLOBAL.read().as_ref() {
        return cfg.clone();
    }
    let mut g = GLOBAL.write();
    g.get_or_insert_with(|| Arc::new(EngineConfig::default()))
        .clone()
}

/// 替换进程级默认配置。只影响之后创建的实例。
pub fn install(cfg: EngineConfig) -> Result<()> {
    cfg.validate()?;
    tracing::info!(
        "Engine config installed: segment_length={} block_size={} guaranteed_memory={}",
        cfg.segment_length,
        cfg.block_size,
        cfg.guaranteed_memory_bytes
    );
    *GLOBAL.write() = Some(Arc::new(cfg));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str("block_size = 512\nsegment_length = 64\n").unwrap();
        assert_eq!(cfg.block_size, 512);
        assert_eq!(cfg.segment_length, 64);
        assert_eq!(cfg.guaranteed_memory_bytes, DEFAULT_GUARANTEED_MEMORY);
        assert_eq!(cfg.parallel_sort_threshold, 10_000);
    }

    #[test]
    fn rejects_tiny_memory_limit() {
        let err = EngineConfig::from_toml_str("guaranteed_memory_bytes = 1024").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_zero_block_size() {
        let cfg = EngineConfig {
            block_size: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("engine.toml");
        std::fs::write(&p, "initial_list_capacity = 8\n").unwrap();
        let cfg = EngineConfig::load(&p).unwrap();
        assert_eq!(cfg.initial_list_capacity, 8);
    }
}
