use crate::array::sort::{sort_parallel, SortSlots, SplitSlots};
use crate::array::{IndexableArray, TryCompare};
use crate::core::config::{self, EngineConfig};
use crate::core::error::{check_index, check_range};
use crate::core::{Error, ItemCodec, Result, SharedCodec};
use crate::storage::TempMapping;

const WHAT: &str = "MappedArray";

/// 临时内存映射文件上的定长元素数组。
///
/// 元素通过调用方的 codec 与字节互转；所有访问都是带边界检查的切片下标。
/// 长度为 0 时不持有映射。
pub struct MappedArray<T> {
    region: Option<TempMapping>,
    len: u64,
    codec: SharedCodec<T>,
    sort_threshold: u64,
    disposed: bool,
}

impl<T> MappedArray<T> {
    pub fn new(len: u64, codec: SharedCodec<T>) -> Result<Self> {
        Self::with_config(len, codec, &config::global())
    }

    pub fn with_config(len: u64, codec: SharedCodec<T>, cfg: &EngineConfig) -> Result<Self> {
        if codec.width() == 0 {
            return Err(Error::invalid("codec", "item width must be at least 1 byte"));
        }
        let region = Self::map(len, codec.width())?;
        Ok(Self {
            region,
            len,
            codec,
            sort_threshold: cfg.parallel_sort_threshold,
            disposed: false,
        })
    }

    pub fn item_width(&self) -> usize {
        self.codec.width()
    }

    fn map(len: u64, width: usize) -> Result<Option<TempMapping>> {
        if len == 0 {
            return Ok(None);
        }
        let bytes = len
            .checked_mul(width as u64)
            .ok_or_else(|| Error::invalid("len", format!("{len} items overflow the byte length")))?;
        TempMapping::create(bytes).map(Some)
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed(WHAT));
        }
        Ok(())
    }

    fn item_bytes(&self, index: u64) -> Result<&[u8]> {
        let w = self.codec.width();
        let start = index as usize * w;
        match &self.region {
            Some(r) => Ok(&r.bytes()[start..start + w]),
            None => Err(Error::OutOfRange {
                index,
                len: self.len,
            }),
        }
    }
}

impl<T: Send + Sync> IndexableArray<T> for MappedArray<T> {
    fn len(&self) -> u64 {
        self.len
    }

    fn get(&self, index: u64) -> Result<T> {
        self.check_live()?;
        check_index(index, self.len)?;
        Ok(self.codec.decode(self.item_bytes(index)?))
    }

    fn set(&mut self, index: u64, value: T) -> Result<()> {
        self.check_live()?;
        check_index(index, self.len)?;
        let w = self.codec.width();
        let start = index as usize * w;
        if let Some(r) = self.region.as_mut() {
            self.codec.encode(&value, &mut r.bytes_mut()[start..start + w]);
        }
        Ok(())
    }

    fn swap(&mut self, a: u64, b: u64) -> Result<()> {
        self.check_live()?;
        check_index(a, self.len)?;
        check_index(b, self.len)?;
        let w = self.codec.width();
        if let Some(r) = self.region.as_mut() {
            swap_items(r.bytes_mut(), w, a as usize, b as usize);
        }
        Ok(())
    }

    /// 新建映射、拷贝重叠字节、换入新映射，再删除旧映射。
    fn resize(&mut self, new_len: u64) -> Result<()> {
        self.check_live()?;
        if new_len == self.len {
            return Ok(());
        }
        let w = self.codec.width();
        let mut fresh = Self::map(new_len, w)?;
        if let (Some(old), Some(new)) = (&self.region, fresh.as_mut()) {
            let overlap = (self.len.min(new_len) as usize) * w;
            new.bytes_mut()[..overlap].copy_from_slice(&old.bytes()[..overlap]);
        }
        let old = std::mem::replace(&mut self.region, fresh);
        self.len = new_len;
        if let Some(old) = old {
            if let Err(e) = old.close() {
                tracing::warn!("Failed to delete replaced mapping: {}", e);
            }
        }
        Ok(())
    }

    fn create_new(&self, len: u64) -> Result<Self> {
        Ok(Self {
            region: Self::map(len, self.codec.width())?,
            len,
            codec: self.codec.clone(),
            sort_threshold: self.sort_threshold,
            disposed: false,
        })
    }

    fn try_sort_by(&mut self, start: u64, count: u64, cmp: TryCompare<'_, T>) -> Result<()> {
        self.check_live()?;
        check_range(start, count, self.len)?;
        if count < 2 {
            return Ok(());
        }
        let w = self.codec.width();
        let threshold = self.sort_threshold;
        let codec: &dyn ItemCodec<T> = self.codec.as_ref();
        let Some(region) = self.region.as_mut() else {
            return Ok(());
        };
        let lo = start as usize * w;
        let hi = (start + count) as usize * w;
        let slots = ByteSlots {
            bytes: &mut region.bytes_mut()[lo..hi],
            codec,
            width: w,
        };
        sort_parallel(slots, cmp, threshold)
    }

    fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        match self.region.take() {
            Some(r) => r.close(),
            None => Ok(()),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl<T> Drop for MappedArray<T> {
    fn drop(&mut self) {
        if let Some(r) = self.region.take() {
            if let Err(e) = r.close() {
                tracing::warn!("Failed to delete mapping on drop: {}", e);
            }
        }
    }
}

fn swap_items(bytes: &mut [u8], w: usize, a: usize, b: usize) {
    if a == b {
        return;
    }
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let (left, right) = bytes.split_at_mut(hi * w);
    left[lo * w..lo * w + w].swap_with_slice(&mut right[..w]);
}

/// 映射字节区间上的排序视图
struct ByteSlots<'a, T> {
    bytes: &'a mut [u8],
    codec: &'a dyn ItemCodec<T>,
    width: usize,
}

impl<T> SortSlots<T> for ByteSlots<'_, T> {
    fn len(&self) -> u64 {
        (self.bytes.len() / self.width) as u64
    }

    fn read(&self, i: u64) -> Result<T> {
        check_index(i, self.len())?;
        let s = i as usize * self.width;
        Ok(self.codec.decode(&self.bytes[s..s + self.width]))
    }

    fn swap(&mut self, a: u64, b: u64) -> Result<()> {
        let n = self.len();
        check_index(a, n)?;
        check_index(b, n)?;
        swap_items(self.bytes, self.width, a as usize, b as usize);
        Ok(())
    }
}

impl<T> SplitSlots<T> for ByteSlots<'_, T> {
    fn split_at(self, mid: u64) -> (Self, Self) {
        let at = (mid as usize * self.width).min(self.bytes.len());
        let (a, b) = self.bytes.split_at_mut(at);
        (
            ByteSlots {
                bytes: a,
                codec: self.codec,
                width: self.width,
            },
            ByteSlots {
                bytes: b,
                codec: self.codec,
                width: self.width,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FixedCodec, FnCodec};
    use rand::{Rng, SeedableRng};

    fn cfg(threshold: u64) -> EngineConfig {
        EngineConfig {
            parallel_sort_threshold: threshold,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn zero_length_holds_no_mapping() {
        let mut a = MappedArray::<i64>::new(0, FixedCodec::shared()).unwrap();
        assert!(a.region.is_none());
        a.resize(0).unwrap();
        a.resize(3).unwrap();
        assert_eq!(a.get(2).unwrap(), 0);
        a.resize(0).unwrap();
        assert!(a.region.is_none());
        assert!(matches!(a.get(0), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn resize_copies_overlap() {
        let mut a = MappedArray::<i64>::new(4, FixedCodec::shared()).unwrap();
        for i in 0..4 {
            a.set(i, -(i as i64) - 1).unwrap();
        }
        a.resize(10).unwrap();
        assert_eq!(a.get(3).unwrap(), -4);
        assert_eq!(a.get(9).unwrap(), 0);
        a.resize(2).unwrap();
        assert_eq!(a.get(1).unwrap(), -2);
        assert!(a.get(2).is_err());
    }

    #[test]
    fn custom_codec_items_sort_in_parallel() {
        let codec = FnCodec::<(u32, u32)>::shared(
            8,
            |b| {
                (
                    u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                    u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
                )
            },
            |v, b| {
                b[..4].copy_from_slice(&v.0.to_le_bytes());
                b[4..].copy_from_slice(&v.1.to_le_bytes());
            },
        );
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        let values: Vec<(u32, u32)> = (0..20_000).map(|i| (rng.gen_range(0..300), i)).collect();
        let mut a = MappedArray::with_config(values.len() as u64, codec, &cfg(1_000)).unwrap();
        for (i, v) in values.iter().enumerate() {
            a.set(i as u64, *v).unwrap();
        }
        a.sort_by(0, a.len(), |x, y| x.cmp(y)).unwrap();

        let mut expected = values;
        expected.sort();
        let got: Vec<(u32, u32)> = a.iter().collect::<Result<_>>().unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn dispose_then_use_fails() {
        let mut a = MappedArray::<u64>::new(2, FixedCodec::shared()).unwrap();
        a.dispose().unwrap();
        a.dispose().unwrap();
        assert!(matches!(a.set(0, 1), Err(Error::Disposed(_))));
    }
}
