use std::cmp::Ordering;
use std::sync::Arc;

use crate::array::{try_binary_search_by, AnyArray, ArraySpec, IndexableArray, Iter, TryCompare};
use crate::core::config::{self, EngineConfig};
use crate::core::error::{check_index, check_range};
use crate::core::{Error, Result};
use crate::index::StorageMode;

/// 可增长列表：`AnyArray` 之上的计数 + 容量。
///
/// 后备数组在第一次需要容量时才创建；满了就翻倍（起点为 `initial_list_capacity`）。
pub struct BigList<T> {
    spec: ArraySpec<T>,
    cfg: Arc<EngineConfig>,
    array: Option<AnyArray<T>>,
    count: u64,
    disposed: bool,
}

impl<T: Clone + Send + Sync> BigList<T> {
    pub fn new(spec: ArraySpec<T>) -> Self {
        Self::with_config(spec, config::global())
    }

    pub fn with_config(spec: ArraySpec<T>, cfg: Arc<EngineConfig>) -> Self {
        Self {
            spec,
            cfg,
            array: None,
            count: 0,
            disposed: false,
        }
    }

    pub fn mode(&self) -> StorageMode {
        self.spec.mode()
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> u64 {
        self.array.as_ref().map_or(0, |a| a.len())
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed("BigList"));
        }
        Ok(())
    }

    fn array(&self) -> Result<&AnyArray<T>> {
        self.array.as_ref().ok_or(Error::OutOfRange {
            index: 0,
            len: 0,
        })
    }

    /// 设置容量；低于当前元素数时不做任何修改直接报错。
    pub fn set_capacity(&mut self, capacity: u64) -> Result<()> {
        self.check_live()?;
        if capacity < self.count {
            return Err(Error::CapacityBelowCount {
                requested: capacity,
                count: self.count,
            });
        }
        match self.array.as_mut() {
            Some(a) => a.resize(capacity),
            None if capacity == 0 => Ok(()),
            None => {
                self.array = Some(self.spec.create(capacity, &self.cfg)?);
                Ok(())
            }
        }
    }

    fn ensure_capacity(&mut self, needed: u64) -> Result<()> {
        let cap = self.capacity();
        if needed <= cap {
            return Ok(());
        }
        let grown = if cap == 0 {
            self.cfg.initial_list_capacity.max(1)
        } else {
            cap.saturating_mul(2)
        };
        self.set_capacity(grown.max(needed))
    }

    /// 追加一个元素，返回它的位置。
    pub fn push(&mut self, item: T) -> Result<u64> {
        self.check_live()?;
        self.ensure_capacity(self.count + 1)?;
        let at = self.count;
        if let Some(a) = self.array.as_mut() {
            a.set(at, item)?;
        }
        self.count += 1;
        Ok(at)
    }

    pub fn get(&self, index: u64) -> Result<T> {
        self.check_live()?;
        check_index(index, self.count)?;
        self.array()?.get(index)
    }

    pub fn set(&mut self, index: u64, item: T) -> Result<()> {
        self.check_live()?;
        check_index(index, self.count)?;
        match self.array.as_mut() {
            Some(a) => a.set(index, item),
            None => Err(Error::OutOfRange { index, len: 0 }),
        }
    }

    /// 容量收缩到元素数。
    pub fn trim_excess(&mut self) -> Result<()> {
        self.set_capacity(self.count)
    }

    /// 丢弃 `len` 之后的元素（容量不变）。
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.check_live()?;
        if len < self.count {
            self.count = len;
        }
        Ok(())
    }

    /// 删除 `[start, start + count)`，后面的元素前移。
    pub fn remove_range(&mut self, start: u64, count: u64) -> Result<()> {
        self.check_live()?;
        check_range(start, count, self.count)?;
        if count == 0 {
            return Ok(());
        }
        if let Some(a) = self.array.as_mut() {
            for src in start + count..self.count {
                let v = a.get(src)?;
                a.set(src - count, v)?;
            }
        }
        self.count -= count;
        Ok(())
    }

    pub fn remove_at(&mut self, index: u64) -> Result<()> {
        check_index(index, self.count)?;
        self.remove_range(index, 1)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.truncate(0)
    }

    pub fn iter(&self) -> Iter<'_, T, Self> {
        Iter::new(self, 0, self.count)
    }

    pub fn iter_range(&self, start: u64, end: u64) -> Iter<'_, T, Self> {
        Iter::new(self, start, end.min(self.count))
    }

    /// 排序 `[0, len)`。
    pub fn try_sort_by(&mut self, cmp: TryCompare<'_, T>) -> Result<()> {
        self.check_live()?;
        let n = self.count;
        match self.array.as_mut() {
            Some(a) => a.try_sort_by(0, n, cmp),
            None => Ok(()),
        }
    }

    pub fn sort_by<F>(&mut self, cmp: F) -> Result<()>
    where
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        self.try_sort_by(&|a: &T, b: &T| Ok(cmp(a, b)))
    }

    /// 在 `[0, len)` 上二分查找；返回值约定同 [`try_binary_search_by`]。
    pub fn binary_search_by<F>(&self, f: F) -> Result<i64>
    where
        F: FnMut(&T) -> Ordering,
    {
        self.check_live()?;
        IndexableArray::binary_search_by(self, 0, self.count, f)
    }

    pub fn try_binary_search_by<F>(&self, f: F) -> Result<i64>
    where
        F: FnMut(&T) -> Result<Ordering>,
    {
        self.check_live()?;
        try_binary_search_by(self, 0, self.count, f)
    }

    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        self.count = 0;
        match self.array.take() {
            Some(mut a) => a.dispose(),
            None => Ok(()),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl<T: Clone + Send + Sync + PartialEq> BigList<T> {
    pub fn index_of(&self, item: &T) -> Result<Option<u64>> {
        IndexableArray::index_of(self, item, 0, self.count)
    }

    pub fn contains(&self, item: &T) -> Result<bool> {
        Ok(self.index_of(item)?.is_some())
    }

    /// 删除第一个等于 `item` 的元素。
    pub fn remove(&mut self, item: &T) -> Result<bool> {
        match self.index_of(item)? {
            Some(i) => {
                self.remove_at(i)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// 列表本身也是（长度为元素数的）数组视图，共享查找 / 迭代实现。
impl<T: Clone + Send + Sync> IndexableArray<T> for BigList<T> {
    fn len(&self) -> u64 {
        self.count
    }

    fn get(&self, index: u64) -> Result<T> {
        BigList::get(self, index)
    }

    fn set(&mut self, index: u64, value: T) -> Result<()> {
        BigList::set(self, index, value)
    }

    /// 按元素数改变长度：增长时新位置为后端默认值。
    fn resize(&mut self, new_len: u64) -> Result<()> {
        self.check_live()?;
        if new_len > self.capacity() {
            self.set_capacity(new_len)?;
        }
        if new_len > self.count {
            // 容量区可能残留截断前的内容，重置为空白值
            let blank = self.spec.blank();
            if let Some(a) = self.array.as_mut() {
                for i in self.count..new_len {
                    a.set(i, blank.clone())?;
                }
            }
        }
        self.count = new_len;
        Ok(())
    }

    fn create_new(&self, len: u64) -> Result<Self> {
        let mut list = BigList::with_config(self.spec.clone(), self.cfg.clone());
        IndexableArray::resize(&mut list, len)?;
        Ok(list)
    }

    fn try_sort_by(&mut self, start: u64, count: u64, cmp: TryCompare<'_, T>) -> Result<()> {
        self.check_live()?;
        check_range(start, count, self.count)?;
        match self.array.as_mut() {
            Some(a) => a.try_sort_by(start, count, cmp),
            None => Ok(()),
        }
    }

    fn dispose(&mut self) -> Result<()> {
        BigList::dispose(self)
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FixedCodec;

    fn cfg(initial: u64) -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            initial_list_capacity: initial,
            segment_length: 8,
            block_size: 64,
            ..EngineConfig::default()
        })
    }

    fn lists() -> Vec<BigList<i64>> {
        vec![
            BigList::with_config(ArraySpec::InMemory { default: 0 }, cfg(4)),
            BigList::with_config(ArraySpec::MemoryMapped(FixedCodec::shared()), cfg(4)),
            BigList::with_config(ArraySpec::RandomAccessFile(FixedCodec::shared()), cfg(4)),
        ]
    }

    #[test]
    fn push_grows_by_doubling() {
        for mut l in lists() {
            assert_eq!(l.capacity(), 0);
            for i in 0..9 {
                assert_eq!(l.push(i * 10).unwrap(), i as u64);
            }
            assert_eq!(l.len(), 9);
            assert_eq!(l.capacity(), 16);
            assert_eq!(l.get(8).unwrap(), 80);
            assert!(matches!(l.get(9), Err(Error::OutOfRange { .. })));
        }
    }

    #[test]
    fn capacity_below_count_fails_without_mutation() {
        for mut l in lists() {
            for i in 0..5 {
                l.push(i).unwrap();
            }
            let cap = l.capacity();
            assert!(matches!(
                l.set_capacity(3),
                Err(Error::CapacityBelowCount {
                    requested: 3,
                    count: 5
                })
            ));
            assert_eq!(l.capacity(), cap);
            l.trim_excess().unwrap();
            assert_eq!(l.capacity(), 5);
            l.clear().unwrap();
            l.set_capacity(0).unwrap();
            assert_eq!(l.capacity(), 0);
        }
    }

    #[test]
    fn remove_shifts_tail() {
        for mut l in lists() {
            for i in 0..8 {
                l.push(i).unwrap();
            }
            l.remove_range(2, 3).unwrap();
            assert!(l.remove(&7).unwrap());
            assert!(!l.remove(&100).unwrap());
            l.remove_at(0).unwrap();
            let v: Vec<i64> = l.iter().collect::<Result<_>>().unwrap();
            assert_eq!(v, vec![1, 5, 6]);
            assert_eq!(l.index_of(&6).unwrap(), Some(2));
        }
    }

    #[test]
    fn sort_and_search_cover_only_the_count() {
        for mut l in lists() {
            for v in [5i64, -3, 9, 0, 9, 2] {
                l.push(v).unwrap();
            }
            l.sort_by(|a, b| a.cmp(b)).unwrap();
            let v: Vec<i64> = l.iter().collect::<Result<_>>().unwrap();
            assert_eq!(v, vec![-3, 0, 2, 5, 9, 9]);
            assert_eq!(l.binary_search_by(|x| x.cmp(&2)).unwrap(), 2);
            assert_eq!(l.binary_search_by(|x| x.cmp(&3)).unwrap(), !3);
        }
    }

    #[test]
    fn truncate_then_regrow_via_resize_reads_default() {
        for mut l in lists() {
            for i in 1..=4 {
                l.push(i).unwrap();
            }
            l.truncate(2).unwrap();
            IndexableArray::resize(&mut l, 4).unwrap();
            let v: Vec<i64> = l.iter().collect::<Result<_>>().unwrap();
            assert_eq!(v, vec![1, 2, 0, 0]);
        }
    }

    #[test]
    fn dispose_is_idempotent() {
        for mut l in lists() {
            l.push(1).unwrap();
            l.dispose().unwrap();
            l.dispose().unwrap();
            assert!(matches!(l.push(2), Err(Error::Disposed(_))));
        }
    }
}
