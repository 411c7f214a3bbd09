use std::any::Any;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::array::{AnyArray, ArraySpec, BigList, IndexableArray};
use crate::core::error::check_index;
use crate::core::{EngineConfig, Error, Result};
use crate::index::{Index, StorageMode};

type Extract<T, K> = Box<dyn Fn(&T) -> K + Send + Sync>;
type KeyCompare<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

/// 有序索引：元素位置的排列，`key(items[positions[i]])` 随 `i` 不减。
///
/// 每次提交把新位置追加到末尾（初值为自身位置），然后整体重排。
pub struct OrderedIndex<T, K> {
    name: String,
    mode: StorageMode,
    cfg: Arc<EngineConfig>,
    extract: Extract<T, K>,
    cmp: KeyCompare<K>,
    positions: Option<AnyArray<i64>>,
}

impl<T, K> OrderedIndex<T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Send + Sync + 'static,
{
    pub fn new<F>(name: impl Into<String>, mode: StorageMode, cfg: Arc<EngineConfig>, extract: F) -> Self
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
        K: Ord,
    {
        Self::with_comparer(name, mode, cfg, extract, |a: &K, b: &K| a.cmp(b))
    }

    pub fn with_comparer<F, C>(
        name: impl Into<String>,
        mode: StorageMode,
        cfg: Arc<EngineConfig>,
        extract: F,
        cmp: C,
    ) -> Self
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
        C: Fn(&K, &K) -> Ordering + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            mode,
            cfg,
            extract: Box::new(extract),
            cmp: Arc::new(cmp),
            positions: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.positions.as_ref().map_or(0, |p| p.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, K> Index<T> for OrderedIndex<T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    fn committing(&mut self, items: &BigList<T>, from: u64, to: u64) -> Result<()> {
        match self.positions.as_mut() {
            Some(p) => p.resize(to)?,
            None => {
                self.positions = Some(ArraySpec::<i64>::fixed(self.mode).create(to, &self.cfg)?);
            }
        }
        let Some(positions) = self.positions.as_mut() else {
            return Ok(());
        };
        for i in from..to {
            positions.set(i, i as i64)?;
        }

        let extract = &self.extract;
        let cmp = &self.cmp;
        let by_key = |a: &i64, b: &i64| -> Result<Ordering> {
            let ka = extract(&items.get(*a as u64)?);
            let kb = extract(&items.get(*b as u64)?);
            Ok(cmp(&ka, &kb))
        };
        positions.try_sort_by(0, to, &by_key)?;
        tracing::debug!("Ordered index '{}' sorted {} positions", self.name, to);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        match self.positions.take() {
            Some(mut p) => p.dispose(),
            None => Ok(()),
        }
    }

    fn dispose(&mut self) -> Result<()> {
        self.reset()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 有序索引的只读视图。
pub struct OrderedView<'a, T, K> {
    pub(crate) index: &'a OrderedIndex<T, K>,
    pub(crate) items: &'a BigList<T>,
}

impl<T, K> Clone for OrderedView<'_, T, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, K> Copy for OrderedView<'_, T, K> {}

impl<'a, T, K> OrderedView<'a, T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Clone + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.index.name
    }

    pub fn len(&self) -> u64 {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 排序后第 `position` 个元素
    pub fn get(&self, position: u64) -> Result<T> {
        check_index(position, self.len())?;
        let positions = self.index.positions.as_ref().ok_or(Error::OutOfRange {
            index: position,
            len: 0,
        })?;
        let p = positions.get(position)?;
        self.items.get(p as u64)
    }

    fn key_at(&self, position: u64) -> Result<K> {
        Ok((self.index.extract)(&self.get(position)?))
    }

    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.index.cmp)(a, b)
    }

    /// 找到时返回某个（不保证首个或末个）键相等的位置，否则返回插入点取反。
    pub fn binary_search(&self, key: &K) -> Result<i64> {
        let Some(positions) = self.index.positions.as_ref() else {
            return Ok(!0);
        };
        positions.try_binary_search_by(0, positions.len(), |p| {
            let k = (self.index.extract)(&self.items.get(*p as u64)?);
            Ok(self.compare(&k, key))
        })
    }

    /// 键相等的第一个位置（从二分结果向前线性扫描）。
    pub fn binary_search_first(&self, key: &K) -> Result<i64> {
        let r = self.binary_search(key)?;
        if r < 0 {
            return Ok(r);
        }
        let mut i = r as u64;
        while i > 0 && self.compare(&self.key_at(i - 1)?, key) == Ordering::Equal {
            i -= 1;
        }
        Ok(i as i64)
    }

    /// 键相等的最后一个位置（从二分结果向后线性扫描）。
    pub fn binary_search_last(&self, key: &K) -> Result<i64> {
        let r = self.binary_search(key)?;
        if r < 0 {
            return Ok(r);
        }
        let len = self.len();
        let mut i = r as u64;
        while i + 1 < len && self.compare(&self.key_at(i + 1)?, key) == Ordering::Equal {
            i += 1;
        }
        Ok(i as i64)
    }

    pub fn items(&self, key: K) -> OrderedItems<'a, T, K> {
        OrderedItems::new(*self, Start::First(key.clone()), Stop::WhileEqual(key))
    }

    /// `lo <= key <= hi` 的元素，按键升序。
    pub fn items_in_range(&self, lo: K, hi: K) -> OrderedItems<'a, T, K> {
        OrderedItems::new(*self, Start::First(lo), Stop::WhileAtMost(hi))
    }

    pub fn all_items(&self) -> OrderedItems<'a, T, K> {
        OrderedItems::new(*self, Start::At(0), Stop::End)
    }

    pub fn items_greater_than(&self, key: K) -> OrderedItems<'a, T, K> {
        OrderedItems::new(*self, Start::AfterLast(key), Stop::End)
    }

    pub fn items_greater_than_or_equal(&self, key: K) -> OrderedItems<'a, T, K> {
        OrderedItems::new(*self, Start::First(key), Stop::End)
    }

    pub fn items_less_than(&self, key: K) -> OrderedItems<'a, T, K> {
        OrderedItems::new(*self, Start::At(0), Stop::WhileBelow(key))
    }

    pub fn items_less_than_or_equal(&self, key: K) -> OrderedItems<'a, T, K> {
        OrderedItems::new(*self, Start::At(0), Stop::WhileAtMost(key))
    }
}

enum Start<K> {
    At(u64),
    /// 第一个 `>= key` 的位置
    First(K),
    /// 第一个 `> key` 的位置
    AfterLast(K),
}

enum Stop<K> {
    End,
    WhileEqual(K),
    WhileAtMost(K),
    WhileBelow(K),
}

/// 有序索引上的惰性区间扫描；越过边界条件立刻结束。
pub struct OrderedItems<'a, T, K> {
    view: OrderedView<'a, T, K>,
    start: Option<Start<K>>,
    stop: Stop<K>,
    pos: u64,
    done: bool,
}

impl<'a, T, K> OrderedItems<'a, T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Clone + Send + Sync + 'static,
{
    fn new(view: OrderedView<'a, T, K>, start: Start<K>, stop: Stop<K>) -> Self {
        Self {
            view,
            start: Some(start),
            stop,
            pos: 0,
            done: false,
        }
    }

    fn resolve(&self, start: Start<K>) -> Result<u64> {
        Ok(match start {
            Start::At(p) => p,
            Start::First(k) => {
                let r = self.view.binary_search_first(&k)?;
                if r < 0 {
                    !r as u64
                } else {
                    r as u64
                }
            }
            Start::AfterLast(k) => {
                let r = self.view.binary_search_last(&k)?;
                if r < 0 {
                    !r as u64
                } else {
                    r as u64 + 1
                }
            }
        })
    }

    fn key_of(&self, item: &T) -> K {
        (self.view.index.extract)(item)
    }

    fn step(&mut self) -> Result<Option<T>> {
        if let Some(start) = self.start.take() {
            self.pos = self.resolve(start)?;
        }
        if self.pos >= self.view.len() {
            return Ok(None);
        }
        let item = self.view.get(self.pos)?;
        let within = match &self.stop {
            Stop::End => true,
            Stop::WhileEqual(k) => self.view.compare(&self.key_of(&item), k) == Ordering::Equal,
            Stop::WhileAtMost(k) => self.view.compare(&self.key_of(&item), k) != Ordering::Greater,
            Stop::WhileBelow(k) => self.view.compare(&self.key_of(&item), k) == Ordering::Less,
        };
        if !within {
            return Ok(None);
        }
        self.pos += 1;
        Ok(Some(item))
    }
}

impl<T, K> Iterator for OrderedItems<'_, T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Clone + Send + Sync + 'static,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
