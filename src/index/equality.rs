use std::any::Any;
use std::sync::Arc;

use crate::array::{AnyArray, ArraySpec, BigList, IndexableArray};
use crate::core::{EngineConfig, Error, Result};
use crate::index::{adapt_length, DefaultKeyComparer, Index, KeyComparer, Node, StorageMode};

pub const DEFAULT_EXPECTED_ITEMS_PER_KEY: u64 = 3;
/// 每键期望条目数的上限（与 32 位桶数一致）
pub const MAX_EXPECTED_ITEMS_PER_KEY: u64 = i32::MAX as u64;

type Extract<T, K> = Box<dyn Fn(&T) -> K + Send + Sync>;

/// 等值（哈希）索引。
///
/// - `buckets[b]`：桶 `b` 的链头节点位置，`-1` 为空
/// - `nodes[p]`：位置 `p` 的元素对应的节点（与元素平行）
/// - 新提交的元素头插进桶链；容量不够时至少翻倍并逐链重挂
pub struct EqualityIndex<T, K> {
    name: String,
    mode: StorageMode,
    cfg: Arc<EngineConfig>,
    extract: Extract<T, K>,
    comparer: Box<dyn KeyComparer<K>>,
    expected_per_key: u64,
    buckets: Option<AnyArray<i64>>,
    nodes: Option<AnyArray<Node>>,
}

impl<T, K> EqualityIndex<T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Send + Sync + 'static,
{
    pub fn new<F>(name: impl Into<String>, mode: StorageMode, cfg: Arc<EngineConfig>, extract: F) -> Self
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
        K: std::hash::Hash + Eq,
    {
        Self::build(
            name.into(),
            mode,
            cfg,
            Box::new(extract),
            Box::new(DefaultKeyComparer),
            DEFAULT_EXPECTED_ITEMS_PER_KEY,
        )
    }

    pub fn with_comparer<F, C>(
        name: impl Into<String>,
        mode: StorageMode,
        cfg: Arc<EngineConfig>,
        extract: F,
        comparer: C,
        expected_per_key: u64,
    ) -> Result<Self>
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
        C: KeyComparer<K> + 'static,
    {
        if !(1..=MAX_EXPECTED_ITEMS_PER_KEY).contains(&expected_per_key) {
            return Err(Error::invalid(
                "expected_items_per_key",
                format!("must be in 1..={MAX_EXPECTED_ITEMS_PER_KEY}"),
            ));
        }
        Ok(Self::build(
            name.into(),
            mode,
            cfg,
            Box::new(extract),
            Box::new(comparer),
            expected_per_key,
        ))
    }

    fn build(
        name: String,
        mode: StorageMode,
        cfg: Arc<EngineConfig>,
        extract: Extract<T, K>,
        comparer: Box<dyn KeyComparer<K>>,
        expected_per_key: u64,
    ) -> Self {
        Self {
            name,
            mode,
            cfg,
            extract,
            comparer,
            expected_per_key,
            buckets: None,
            nodes: None,
        }
    }

    pub fn expected_items_per_key(&self) -> u64 {
        self.expected_per_key
    }

    pub fn bucket_count(&self) -> u64 {
        self.buckets.as_ref().map_or(0, |b| b.len())
    }

    pub fn node_capacity(&self) -> u64 {
        self.nodes.as_ref().map_or(0, |n| n.len())
    }

    fn bucket_spec(&self) -> ArraySpec<i64> {
        match self.mode {
            // 内存后端的缺省值就是空桶，不必逐个写 -1
            StorageMode::InMemory => ArraySpec::InMemory { default: -1 },
            mode => ArraySpec::fixed(mode),
        }
    }

    fn new_buckets(&self, count: u64) -> Result<AnyArray<i64>> {
        let mut b = self.bucket_spec().create(count, &self.cfg)?;
        if self.mode != StorageMode::InMemory {
            for i in 0..count {
                b.set(i, -1)?;
            }
        }
        Ok(b)
    }

    /// `buckets * avg` 个节点槽位，溢出时报错。
    fn node_slots(&self, buckets: u64) -> Result<u64> {
        buckets.checked_mul(self.expected_per_key).ok_or_else(|| {
            Error::invalid(
                "expected_items_per_key",
                format!("{buckets} buckets x {} overflows the node count", self.expected_per_key),
            )
        })
    }

    fn bucket_of(hash: i32, bucket_count: u64) -> u64 {
        (hash & i32::MAX) as u64 % bucket_count
    }

    /// 节点容量扩到 `adapt(new_unadapted) * avg`，桶数变化时逐链重挂。
    fn grow(&mut self, new_unadapted: u64) -> Result<()> {
        let new_size = adapt_length(new_unadapted);
        let slots = self.node_slots(new_size)?;
        if let Some(nodes) = self.nodes.as_mut() {
            nodes.resize(slots)?;
        }

        let bucket_count = new_size.min(i32::MAX as u64);
        if bucket_count == self.bucket_count() {
            return Ok(());
        }
        let mut fresh = self.new_buckets(bucket_count)?;

        let (Some(old), Some(nodes)) = (self.buckets.as_ref(), self.nodes.as_mut()) else {
            return Ok(());
        };
        for b in 0..old.len() {
            let mut at = old.get(b)?;
            while at != -1 {
                let mut node = nodes.get(at as u64)?;
                let next = node.next_node;
                let nb = Self::bucket_of(node.hash_code, bucket_count);
                node.next_node = fresh.get(nb)?;
                nodes.set(at as u64, node)?;
                fresh.set(nb, at)?;
                at = next;
            }
        }

        tracing::debug!(
            "Equality index '{}' rehashed: buckets {} -> {}",
            self.name,
            old.len(),
            bucket_count
        );
        if let Some(mut old) = self.buckets.replace(fresh) {
            old.dispose()?;
        }
        Ok(())
    }

    fn add(&mut self, item: &T, position: u64) -> Result<()> {
        let key = (self.extract)(item);
        let hash = self.comparer.hash_code(&key);
        let (Some(buckets), Some(nodes)) = (self.buckets.as_mut(), self.nodes.as_mut()) else {
            return Err(Error::invalid("index", "committing before allocation"));
        };
        let b = Self::bucket_of(hash, buckets.len());
        let node = Node {
            hash_code: hash,
            item_index: position,
            next_node: buckets.get(b)?,
        };
        nodes.set(position, node)?;
        buckets.set(b, position as i64)
    }
}

impl<T, K> Index<T> for EqualityIndex<T, K>
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
        let avg = self.expected_per_key;
        if self.nodes.is_none() {
            let adapted = adapt_length(to.div_ceil(avg));
            let slots = self.node_slots(adapted)?;
            self.nodes = Some(ArraySpec::<Node>::fixed(self.mode).create(slots, &self.cfg)?);
            self.buckets = Some(self.new_buckets(adapted)?);
        } else if self.node_capacity() < to {
            let bigger = to.max(self.node_capacity().saturating_mul(2));
            self.grow(bigger.div_ceil(avg))?;
        }

        for i in from..to {
            let item = items.get(i)?;
            self.add(&item, i)?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let b = self.buckets.take().map(|mut b| b.dispose());
        let n = self.nodes.take().map(|mut n| n.dispose());
        b.unwrap_or(Ok(()))?;
        n.unwrap_or(Ok(()))
    }

    fn dispose(&mut self) -> Result<()> {
        self.reset()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 等值索引的只读视图（借用索引器，事务进行中无法取得）。
pub struct EqualityView<'a, T, K> {
    pub(crate) index: &'a EqualityIndex<T, K>,
    pub(crate) items: &'a BigList<T>,
}

impl<'a, T, K> EqualityView<'a, T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.index.name
    }

    pub fn bucket_count(&self) -> u64 {
        self.index.bucket_count()
    }

    pub fn expected_items_per_key(&self) -> u64 {
        self.index.expected_per_key
    }

    /// 键等于 `key` 的全部元素（桶链顺序，惰性）。
    pub fn items(&self, key: K) -> EqualityItems<'a, T, K> {
        let hash = self.index.comparer.hash_code(&key);
        let head = match &self.index.buckets {
            Some(b) if b.len() > 0 => b.get(EqualityIndex::<T, K>::bucket_of(hash, b.len())),
            _ => Ok(-1),
        };
        let (next, pending) = match head {
            Ok(h) => (h, None),
            Err(e) => (-1, Some(e)),
        };
        EqualityItems {
            index: self.index,
            items: self.items,
            key,
            hash,
            next,
            pending,
        }
    }

    pub fn contains_key(&self, key: K) -> Result<bool> {
        Ok(self.items(key).next().transpose()?.is_some())
    }
}

/// 沿桶链惰性产出：先比哈希，再比完整键。
pub struct EqualityItems<'a, T, K> {
    index: &'a EqualityIndex<T, K>,
    items: &'a BigList<T>,
    key: K,
    hash: i32,
    next: i64,
    pending: Option<Error>,
}

impl<T, K> EqualityItems<'_, T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Send + Sync + 'static,
{
    fn step(&mut self) -> Result<Option<T>> {
        let Some(nodes) = self.index.nodes.as_ref() else {
            return Ok(None);
        };
        while self.next != -1 {
            let node = nodes.get(self.next as u64)?;
            self.next = node.next_node;
            if node.hash_code != self.hash {
                continue;
            }
            let item = self.items.get(node.item_index)?;
            if self.index.comparer.equals(&(self.index.extract)(&item), &self.key) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }
}

impl<T, K> Iterator for EqualityItems<'_, T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Send + Sync + 'static,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending.take() {
            return Some(Err(e));
        }
        match self.step() {
            Ok(v) => v.map(Ok),
            Err(e) => {
                self.next = -1;
                Some(Err(e))
            }
        }
    }
}
