use crate::array::{FileArray, InMemoryArray, IndexableArray, MappedArray, TryCompare};
use crate::core::{EngineConfig, FixedCodec, FixedWidth, Result, SharedCodec};
use crate::index::StorageMode;

/// 建数组所需的后端描述：内存后端给默认值，两种文件后端给 codec。
#[derive(Clone)]
pub enum ArraySpec<T> {
    InMemory { default: T },
    MemoryMapped(SharedCodec<T>),
    RandomAccessFile(SharedCodec<T>),
}

impl<T> ArraySpec<T> {
    pub fn mode(&self) -> StorageMode {
        match self {
            ArraySpec::InMemory { .. } => StorageMode::InMemory,
            ArraySpec::MemoryMapped(_) => StorageMode::MemoryMapped,
            ArraySpec::RandomAccessFile(_) => StorageMode::RandomAccessFile,
        }
    }
}

impl<T: Clone + Send + Sync> ArraySpec<T> {
    /// 新位置的初始值：内存后端的默认值，文件后端的全零编码。
    pub fn blank(&self) -> T {
        match self {
            ArraySpec::InMemory { default } => default.clone(),
            ArraySpec::MemoryMapped(codec) | ArraySpec::RandomAccessFile(codec) => {
                codec.decode(&vec![0u8; codec.width()])
            }
        }
    }

    pub fn create(&self, len: u64, cfg: &EngineConfig) -> Result<AnyArray<T>> {
        Ok(match self {
            ArraySpec::InMemory { default } => {
                AnyArray::InMemory(InMemoryArray::with_config(len, default.clone(), cfg))
            }
            ArraySpec::MemoryMapped(codec) => {
                AnyArray::MemoryMapped(MappedArray::with_config(len, codec.clone(), cfg)?)
            }
            ArraySpec::RandomAccessFile(codec) => {
                AnyArray::RandomAccessFile(FileArray::with_config(len, codec.clone(), cfg)?)
            }
        })
    }
}

impl<T: FixedWidth + Default> ArraySpec<T> {
    /// 内置定长类型（i64 / Node 等）按存储模式选后端
    pub fn fixed(mode: StorageMode) -> Self {
        match mode {
            StorageMode::InMemory => ArraySpec::InMemory {
                default: T::default(),
            },
            StorageMode::MemoryMapped => ArraySpec::MemoryMapped(FixedCodec::shared()),
            StorageMode::RandomAccessFile => ArraySpec::RandomAccessFile(FixedCodec::shared()),
        }
    }
}

/// 运行时选择的后端。列表和索引都持有它。
pub enum AnyArray<T> {
    InMemory(InMemoryArray<T>),
    MemoryMapped(MappedArray<T>),
    RandomAccessFile(FileArray<T>),
}

macro_rules! dispatch {
    ($self:expr, $a:ident => $body:expr) => {
        match $self {
            AnyArray::InMemory($a) => $body,
            AnyArray::MemoryMapped($a) => $body,
            AnyArray::RandomAccessFile($a) => $body,
        }
    };
}

impl<T> AnyArray<T> {
    pub fn mode(&self) -> StorageMode {
        match self {
            AnyArray::InMemory(_) => StorageMode::InMemory,
            AnyArray::MemoryMapped(_) => StorageMode::MemoryMapped,
            AnyArray::RandomAccessFile(_) => StorageMode::RandomAccessFile,
        }
    }
}

impl<T: Clone + Send + Sync> IndexableArray<T> for AnyArray<T> {
    fn len(&self) -> u64 {
        dispatch!(self, a => a.len())
    }

    fn get(&self, index: u64) -> Result<T> {
        dispatch!(self, a => a.get(index))
    }

    fn set(&mut self, index: u64, value: T) -> Result<()> {
        dispatch!(self, a => a.set(index, value))
    }

    fn swap(&mut self, x: u64, y: u64) -> Result<()> {
        dispatch!(self, a => a.swap(x, y))
    }

    fn resize(&mut self, new_len: u64) -> Result<()> {
        dispatch!(self, a => a.resize(new_len))
    }

    fn create_new(&self, len: u64) -> Result<Self> {
        Ok(match self {
            AnyArray::InMemory(a) => AnyArray::InMemory(a.create_new(len)?),
            AnyArray::MemoryMapped(a) => AnyArray::MemoryMapped(a.create_new(len)?),
            AnyArray::RandomAccessFile(a) => AnyArray::RandomAccessFile(a.create_new(len)?),
        })
    }

    fn try_sort_by(&mut self, start: u64, count: u64, cmp: TryCompare<'_, T>) -> Result<()> {
        dispatch!(self, a => a.try_sort_by(start, count, cmp))
    }

    fn dispose(&mut self) -> Result<()> {
        dispatch!(self, a => a.dispose())
    }

    fn is_disposed(&self) -> bool {
        dispatch!(self, a => a.is_disposed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mode_creates_matching_backend() {
        let cfg = EngineConfig::default();
        for mode in StorageMode::ALL {
            let mut a = ArraySpec::<i64>::fixed(mode).create(5, &cfg).unwrap();
            assert_eq!(a.mode(), mode);
            a.set(4, -9).unwrap();
            a.swap(0, 4).unwrap();
            assert_eq!(a.get(0).unwrap(), -9);

            let b = a.create_new(2).unwrap();
            assert_eq!(b.mode(), mode);
            assert_eq!(b.len(), 2);
            a.dispose().unwrap();
            assert!(a.is_disposed());
        }
    }
}
