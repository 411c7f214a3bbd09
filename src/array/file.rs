use crate::array::sort::{sort_parallel, SortSlots, SplitSlots};
use crate::array::{IndexableArray, TryCompare};
use crate::core::config::{self, EngineConfig};
use crate::core::error::{check_index, check_range};
use crate::core::{Error, ItemCodec, Result, SharedCodec};
use crate::storage::BlockStore;

const WHAT: &str = "FileArray";

/// 经 [`BlockStore`] 读写临时文件的定长元素数组。
///
/// 下标按逻辑字节长度 / 元素宽度做边界检查。排序与其他后端共用有界并行
/// quicksort；各分区的 I/O 仍在存储的实例锁上串行。
pub struct FileArray<T> {
    store: BlockStore,
    len: u64,
    codec: SharedCodec<T>,
    cfg: EngineConfig,
    disposed: bool,
}

impl<T> FileArray<T> {
    pub fn new(len: u64, codec: SharedCodec<T>) -> Result<Self> {
        Self::with_config(len, codec, &config::global())
    }

    pub fn with_config(len: u64, codec: SharedCodec<T>, cfg: &EngineConfig) -> Result<Self> {
        let width = codec.width() as u64;
        if width == 0 {
            return Err(Error::invalid("codec", "item width must be at least 1 byte"));
        }
        let bytes = len
            .checked_mul(width)
            .ok_or_else(|| Error::invalid("len", format!("{len} items overflow the byte length")))?;

        let store = BlockStore::create_temp_with_config(cfg)?;
        // 临时文件释放时就删除，没必要最后再 flush
        store.set_flush_on_dispose(false);
        store.set_len(bytes)?;
        Ok(Self {
            store,
            len,
            codec,
            cfg: cfg.clone(),
            disposed: false,
        })
    }

    pub fn item_width(&self) -> usize {
        self.codec.width()
    }

    /// 后备块存储（统计 / 手动触发回收）
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed(WHAT));
        }
        Ok(())
    }

    fn offset(&self, index: u64) -> u64 {
        index * self.codec.width() as u64
    }

    fn read_item(&self, index: u64) -> Result<T> {
        let mut buf = vec![0u8; self.codec.width()];
        self.store.read_exact_at(&mut buf, self.offset(index))?;
        Ok(self.codec.decode(&buf))
    }

    fn write_item(&self, index: u64, value: &T) -> Result<()> {
        let mut buf = vec![0u8; self.codec.width()];
        self.codec.encode(value, &mut buf);
        self.store.write_all_at(&buf, self.offset(index))
    }
}

impl<T: Send + Sync> IndexableArray<T> for FileArray<T> {
    fn len(&self) -> u64 {
        self.len
    }

    fn get(&self, index: u64) -> Result<T> {
        self.check_live()?;
        check_index(index, self.len)?;
        self.read_item(index)
    }

    fn set(&mut self, index: u64, value: T) -> Result<()> {
        self.check_live()?;
        check_index(index, self.len)?;
        self.write_item(index, &value)
    }

    fn swap(&mut self, a: u64, b: u64) -> Result<()> {
        self.check_live()?;
        check_index(a, self.len)?;
        check_index(b, self.len)?;
        if a == b {
            return Ok(());
        }
        let w = self.codec.width();
        let mut x = vec![0u8; w];
        let mut y = vec![0u8; w];
        self.store.read_exact_at(&mut x, self.offset(a))?;
        self.store.read_exact_at(&mut y, self.offset(b))?;
        self.store.write_all_at(&y, self.offset(a))?;
        self.store.write_all_at(&x, self.offset(b))
    }

    fn resize(&mut self, new_len: u64) -> Result<()> {
        self.check_live()?;
        let bytes = new_len
            .checked_mul(self.codec.width() as u64)
            .ok_or_else(|| Error::invalid("len", format!("{new_len} items overflow the byte length")))?;
        self.store.set_len(bytes)?;
        self.len = new_len;
        Ok(())
    }

    fn create_new(&self, len: u64) -> Result<Self> {
        Self::with_config(len, self.codec.clone(), &self.cfg)
    }

    fn try_sort_by(&mut self, start: u64, count: u64, cmp: TryCompare<'_, T>) -> Result<()> {
        self.check_live()?;
        check_range(start, count, self.len)?;
        if count < 2 {
            return Ok(());
        }
        let slots = FileSlots {
            store: &self.store,
            codec: self.codec.as_ref(),
            base: start,
            len: count,
        };
        sort_parallel(slots, cmp, self.cfg.parallel_sort_threshold)
    }

    fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.store.dispose()
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}

/// `[base, base + len)` 的排序视图。切分出的视图互不重叠，可交给不同 worker。
struct FileSlots<'a, T> {
    store: &'a BlockStore,
    codec: &'a dyn ItemCodec<T>,
    base: u64,
    len: u64,
}

impl<T> FileSlots<'_, T> {
    fn offset(&self, i: u64) -> u64 {
        (self.base + i) * self.codec.width() as u64
    }
}

impl<T> SortSlots<T> for FileSlots<'_, T> {
    fn len(&self) -> u64 {
        self.len
    }

    fn read(&self, i: u64) -> Result<T> {
        check_index(i, self.len)?;
        let mut buf = vec![0u8; self.codec.width()];
        self.store.read_exact_at(&mut buf, self.offset(i))?;
        Ok(self.codec.decode(&buf))
    }

    fn swap(&mut self, a: u64, b: u64) -> Result<()> {
        check_index(a, self.len)?;
        check_index(b, self.len)?;
        if a == b {
            return Ok(());
        }
        let w = self.codec.width();
        let mut x = vec![0u8; w];
        let mut y = vec![0u8; w];
        self.store.read_exact_at(&mut x, self.offset(a))?;
        self.store.read_exact_at(&mut y, self.offset(b))?;
        self.store.write_all_at(&y, self.offset(a))?;
        self.store.write_all_at(&x, self.offset(b))
    }
}

impl<T> SplitSlots<T> for FileSlots<'_, T> {
    fn split_at(self, mid: u64) -> (Self, Self) {
        let mid = mid.min(self.len);
        (
            FileSlots {
                store: self.store,
                codec: self.codec,
                base: self.base,
                len: mid,
            },
            FileSlots {
                store: self.store,
                codec: self.codec,
                base: self.base + mid,
                len: self.len - mid,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FixedCodec;
    use rand::{Rng, SeedableRng};

    fn small_blocks() -> EngineConfig {
        EngineConfig {
            block_size: 64,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn items_straddling_blocks_round_trip() {
        // 64 字节块、12 字节元素：部分元素跨块
        let codec = crate::core::FnCodec::<(i64, i32)>::shared(
            12,
            |b| {
                let mut x = [0u8; 8];
                x.copy_from_slice(&b[..8]);
                let mut y = [0u8; 4];
                y.copy_from_slice(&b[8..12]);
                (i64::from_le_bytes(x), i32::from_le_bytes(y))
            },
            |v, b| {
                b[..8].copy_from_slice(&v.0.to_le_bytes());
                b[8..12].copy_from_slice(&v.1.to_le_bytes());
            },
        );
        let mut a = FileArray::with_config(100, codec, &small_blocks()).unwrap();
        for i in 0..100u64 {
            a.set(i, (i as i64 * 1_000, -(i as i32))).unwrap();
        }
        a.store().request_collection().unwrap();
        a.store().request_collection().unwrap();
        for i in 0..100u64 {
            assert_eq!(a.get(i).unwrap(), (i as i64 * 1_000, -(i as i32)));
        }
    }

    #[test]
    fn bounds_follow_logical_length() {
        let mut a = FileArray::<u32>::with_config(3, FixedCodec::shared(), &small_blocks()).unwrap();
        assert_eq!(a.store().len().unwrap(), 12);
        assert!(matches!(a.get(3), Err(Error::OutOfRange { .. })));
        a.resize(0).unwrap();
        assert_eq!(a.store().len().unwrap(), 0);
        a.resize(5).unwrap();
        assert_eq!(a.get(4).unwrap(), 0);
    }

    #[test]
    fn parallel_sort_over_blocks_matches_std() {
        let cfg = EngineConfig {
            block_size: 256,
            parallel_sort_threshold: 100,
            ..EngineConfig::default()
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(77);
        let values: Vec<i64> = (0..20_000).map(|_| rng.gen_range(-50_000..50_000)).collect();
        let mut a = FileArray::with_config(values.len() as u64, FixedCodec::shared(), &cfg).unwrap();
        for (i, v) in values.iter().enumerate() {
            a.set(i as u64, *v).unwrap();
        }

        let partitions = || {
            let s = crate::stats::MemoryReport::collect().sort;
            s.partitions_offloaded + s.partitions_inline
        };
        let before = partitions();
        a.sort_by(0, a.len(), |x: &i64, y: &i64| x.cmp(y)).unwrap();
        assert!(partitions() > before);

        let mut expected = values;
        expected.sort();
        let got: Vec<i64> = a.iter().collect::<Result<_>>().unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn subrange_sort_leaves_outside_untouched() {
        let mut a = FileArray::with_config(10, FixedCodec::shared(), &small_blocks()).unwrap();
        for (i, v) in [9i64, 8, 7, 6, 5, 4, 3, 2, 1, 0].iter().enumerate() {
            a.set(i as u64, *v).unwrap();
        }
        a.sort_by(2, 5, |x: &i64, y: &i64| x.cmp(y)).unwrap();
        let got: Vec<i64> = a.iter().collect::<Result<_>>().unwrap();
        assert_eq!(got, vec![9, 8, 3, 4, 5, 6, 7, 2, 1, 0]);
    }

    #[test]
    fn small_sort_matches_std() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(21);
        let values: Vec<i64> = (0..2_000).map(|_| rng.gen_range(-1_000..1_000)).collect();
        let mut a = FileArray::with_config(values.len() as u64, FixedCodec::shared(), &small_blocks())
            .unwrap();
        for (i, v) in values.iter().enumerate() {
            a.set(i as u64, *v).unwrap();
        }
        a.sort_by(0, a.len(), |x: &i64, y: &i64| x.cmp(y)).unwrap();
        let mut expected = values;
        expected.sort();
        let got: Vec<i64> = a.iter().collect::<Result<_>>().unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn dispose_releases_store() {
        let mut a = FileArray::<u64>::new(4, FixedCodec::shared()).unwrap();
        a.dispose().unwrap();
        assert!(a.store().is_disposed());
        assert!(matches!(a.get(0), Err(Error::Disposed(_))));
        a.dispose().unwrap();
    }
}
