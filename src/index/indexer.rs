use std::cmp::Ordering;
use std::sync::Arc;

use crate::array::{ArraySpec, BigList, Iter};
use crate::core::config::{self, EngineConfig};
use crate::core::{Error, Result, SharedCodec};
use crate::index::{
    EqualityIndex, EqualityView, Index, KeyComparer, OrderedIndex, OrderedView, StorageMode,
    Transaction,
};

/// 事务性索引器：元素列表 + 已提交计数 + 按登记顺序排列的索引。
///
/// 状态机：`Idle -> 事务(depth 1..N) -> Commit | Rollback -> Idle`。
/// 事务以 [`Transaction`] 守卫表示，它可变借用索引器，
/// 因此事务进行中无法取得任何索引视图。
///
/// 不是内部线程安全的：同一个索引器上的操作需要调用方串行化。
pub struct Indexer<T> {
    pub(crate) items: BigList<T>,
    pub(crate) committed: u64,
    pub(crate) indexes: Vec<Box<dyn Index<T>>>,
    pub(crate) depth: u32,
    pub(crate) must_rollback: bool,
    mode: StorageMode,
    cfg: Arc<EngineConfig>,
    disposed: bool,
}

impl<T: Clone + Default + Send + Sync + 'static> Indexer<T> {
    pub fn in_memory() -> Self {
        Self::in_memory_with_config(config::global())
    }

    pub fn in_memory_with_config(cfg: Arc<EngineConfig>) -> Self {
        Self::with_spec(ArraySpec::InMemory {
            default: T::default(),
        }, cfg)
    }
}

impl<T: Clone + Send + Sync + 'static> Indexer<T> {
    pub fn memory_mapped(codec: SharedCodec<T>) -> Self {
        Self::memory_mapped_with_config(codec, config::global())
    }

    pub fn memory_mapped_with_config(codec: SharedCodec<T>, cfg: Arc<EngineConfig>) -> Self {
        Self::with_spec(ArraySpec::MemoryMapped(codec), cfg)
    }

    pub fn random_access_file(codec: SharedCodec<T>) -> Self {
        Self::random_access_file_with_config(codec, config::global())
    }

    pub fn random_access_file_with_config(codec: SharedCodec<T>, cfg: Arc<EngineConfig>) -> Self {
        Self::with_spec(ArraySpec::RandomAccessFile(codec), cfg)
    }

    pub fn with_spec(spec: ArraySpec<T>, cfg: Arc<EngineConfig>) -> Self {
        let mode = spec.mode();
        tracing::debug!("Indexer created: mode={}", mode);
        Self {
            items: BigList::with_config(spec, cfg.clone()),
            committed: 0,
            indexes: Vec::new(),
            depth: 0,
            must_rollback: false,
            mode,
            cfg,
            disposed: false,
        }
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.cfg
    }

    pub fn committed_count(&self) -> u64 {
        self.committed
    }

    /// 已追加但尚未提交的元素数
    pub fn uncommitted_count(&self) -> u64 {
        self.items.len() - self.committed
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed("Indexer"));
        }
        Ok(())
    }

    /// 开启最外层事务。
    pub fn start_transaction(&mut self) -> Result<Transaction<'_, T>> {
        self.check_live()?;
        self.depth += 1;
        Ok(Transaction::new(self))
    }

    /// 已提交元素（按追加顺序）
    pub fn committed_items(&self) -> Iter<'_, T, BigList<T>> {
        self.items.iter_range(0, self.committed)
    }

    /// 全部元素，包括未提交的
    pub fn all_items(&self) -> Iter<'_, T, BigList<T>> {
        self.items.iter()
    }

    pub fn uncommitted_items(&self) -> Iter<'_, T, BigList<T>> {
        self.items.iter_range(self.committed, self.items.len())
    }

    pub fn index_names(&self) -> Vec<&str> {
        self.indexes.iter().map(|i| i.name()).collect()
    }

    /// 登记一个索引。已有提交元素时立即对它单独执行一次全量提交。
    pub fn add_index(&mut self, mut index: Box<dyn Index<T>>) -> Result<()> {
        self.check_live()?;
        if self.indexes.iter().any(|i| i.name() == index.name()) {
            return Err(Error::DuplicateIndex(index.name().to_string()));
        }
        if index.storage_mode() != self.mode {
            return Err(Error::invalid(
                "index",
                format!(
                    "index `{}` uses {} storage but the indexer uses {}",
                    index.name(),
                    index.storage_mode(),
                    self.mode
                ),
            ));
        }
        if self.committed > 0 {
            index.committing(&self.items, 0, self.committed)?;
        }
        tracing::debug!(
            "Index '{}' added over {} committed items",
            index.name(),
            self.committed
        );
        self.indexes.push(index);
        Ok(())
    }

    pub fn add_equality_index<K, F>(&mut self, name: &str, extract: F) -> Result<()>
    where
        K: std::hash::Hash + Eq + Send + Sync + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        let idx = EqualityIndex::new(name, self.mode, self.cfg.clone(), extract);
        self.add_index(Box::new(idx))
    }

    pub fn add_equality_index_with<K, F, C>(
        &mut self,
        name: &str,
        extract: F,
        comparer: C,
        expected_items_per_key: u64,
    ) -> Result<()>
    where
        K: Send + Sync + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
        C: KeyComparer<K> + 'static,
    {
        let idx = EqualityIndex::with_comparer(
            name,
            self.mode,
            self.cfg.clone(),
            extract,
            comparer,
            expected_items_per_key,
        )?;
        self.add_index(Box::new(idx))
    }

    pub fn add_ordered_index<K, F>(&mut self, name: &str, extract: F) -> Result<()>
    where
        K: Ord + Send + Sync + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        let idx = OrderedIndex::new(name, self.mode, self.cfg.clone(), extract);
        self.add_index(Box::new(idx))
    }

    pub fn add_ordered_index_by<K, F, C>(&mut self, name: &str, extract: F, cmp: C) -> Result<()>
    where
        K: Send + Sync + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
        C: Fn(&K, &K) -> Ordering + Send + Sync + 'static,
    {
        let idx = OrderedIndex::with_comparer(name, self.mode, self.cfg.clone(), extract, cmp);
        self.add_index(Box::new(idx))
    }

    fn find(&self, name: &str) -> Result<&dyn Index<T>> {
        self.check_live()?;
        self.indexes
            .iter()
            .find(|i| i.name() == name)
            .map(|i| i.as_ref())
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    pub fn equality_index<K>(&self, name: &str) -> Result<EqualityView<'_, T, K>>
    where
        K: Send + Sync + 'static,
    {
        let index = self
            .find(name)?
            .as_any()
            .downcast_ref::<EqualityIndex<T, K>>()
            .ok_or_else(|| Error::IndexTypeMismatch {
                name: name.to_string(),
                expected: "equality index",
            })?;
        Ok(EqualityView {
            index,
            items: &self.items,
        })
    }

    pub fn ordered_index<K>(&self, name: &str) -> Result<OrderedView<'_, T, K>>
    where
        K: Clone + Send + Sync + 'static,
    {
        let index = self
            .find(name)?
            .as_any()
            .downcast_ref::<OrderedIndex<T, K>>()
            .ok_or_else(|| Error::IndexTypeMismatch {
                name: name.to_string(),
                expected: "ordered index",
            })?;
        Ok(OrderedView {
            index,
            items: &self.items,
        })
    }

    /// 移除并释放一个索引。
    pub fn remove_index(&mut self, name: &str) -> Result<()> {
        self.check_live()?;
        let at = self
            .indexes
            .iter()
            .position(|i| i.name() == name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        let mut index = self.indexes.remove(at);
        index.dispose()
    }

    /// 提交当前层。`depth > 1` 时只是出栈。
    pub(crate) fn commit_level(&mut self) -> Result<()> {
        if self.depth > 1 {
            self.depth -= 1;
            return Ok(());
        }
        if self.must_rollback {
            self.rollback_level()?;
            return Err(Error::RollbackRequested);
        }

        let from = self.committed;
        let to = self.items.len();
        if from == to {
            self.depth = 0;
            return Ok(());
        }
        for i in 0..self.indexes.len() {
            if let Err(e) = self.indexes[i].committing(&self.items, from, to) {
                tracing::warn!(
                    "Index '{}' failed while committing {} item(s): {}",
                    self.indexes[i].name(),
                    to - from,
                    e
                );
                self.recover_after_failed_commit();
                return Err(e);
            }
        }
        self.committed = to;
        self.depth = 0;
        Ok(())
    }

    /// 回滚当前层。`depth > 1` 时只标记，由最外层提交观察。
    pub(crate) fn rollback_level(&mut self) -> Result<()> {
        if self.depth > 1 {
            self.must_rollback = true;
            self.depth -= 1;
            return Ok(());
        }
        self.depth = 0;
        self.must_rollback = false;
        self.items.truncate(self.committed)
    }

    /// 丢掉未提交元素，各索引清空后在已提交区间上重建。
    fn recover_after_failed_commit(&mut self) {
        self.depth = 0;
        self.must_rollback = false;
        if let Err(e) = self.items.truncate(self.committed) {
            tracing::warn!("Failed to drop uncommitted items: {}", e);
        }
        let committed = self.committed;
        for index in self.indexes.iter_mut() {
            let rebuilt = index.reset().and_then(|_| {
                if committed > 0 {
                    index.committing(&self.items, 0, committed)
                } else {
                    Ok(())
                }
            });
            if let Err(e) = rebuilt {
                tracing::warn!("Failed to rebuild index '{}': {}", index.name(), e);
            }
        }
    }

    /// 释放全部索引和元素列表。幂等。
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        let mut first_err = None;
        for mut index in self.indexes.drain(..) {
            if let Err(e) = index.dispose() {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.items.dispose() {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Person {
        id: i64,
        city: String,
    }

    fn person(id: i64, city: &str) -> Person {
        Person {
            id,
            city: city.to_string(),
        }
    }

    /// 可切换成失败、并记录提交调用次数的索引
    struct Flaky {
        fail: Arc<AtomicBool>,
        calls: Arc<AtomicU64>,
        seen: u64,
    }

    impl Flaky {
        fn new(fail: &Arc<AtomicBool>, calls: &Arc<AtomicU64>) -> Box<Self> {
            Box::new(Flaky {
                fail: fail.clone(),
                calls: calls.clone(),
                seen: 0,
            })
        }
    }

    impl Index<Person> for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn storage_mode(&self) -> StorageMode {
            StorageMode::InMemory
        }
        fn committing(&mut self, _items: &BigList<Person>, _from: u64, to: u64) -> Result<()> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.fail.load(AtomicOrdering::SeqCst) {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.seen = to;
            Ok(())
        }
        fn reset(&mut self) -> Result<()> {
            self.seen = 0;
            Ok(())
        }
        fn dispose(&mut self) -> Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn commit_makes_items_visible() {
        let mut ix = Indexer::<Person>::in_memory();
        ix.add_equality_index("city", |p: &Person| p.city.clone()).unwrap();

        let mut tx = ix.start_transaction().unwrap();
        tx.add(person(1, "Oslo")).unwrap();
        assert_eq!(tx.uncommitted_count(), 1);
        tx.commit().unwrap();

        assert_eq!(ix.committed_count(), 1);
        assert!(!ix.in_transaction());
        let got: Vec<Person> = ix.committed_items().collect::<Result<_>>().unwrap();
        assert_eq!(got, vec![person(1, "Oslo")]);
        let by_city = ix.equality_index::<String>("city").unwrap();
        assert_eq!(by_city.items("Oslo".to_string()).count(), 1);
    }

    #[test]
    fn inner_rollback_poisons_outer_commit() {
        let mut ix = Indexer::<Person>::in_memory();
        {
            let mut outer = ix.start_transaction().unwrap();
            outer.add(person(1, "a")).unwrap();
            {
                let mut inner = outer.start_nested();
                inner.add(person(2, "b")).unwrap();
                inner.rollback().unwrap();
            }
            assert!(outer.was_rollback_requested());
            assert!(matches!(outer.commit(), Err(Error::RollbackRequested)));
        }
        assert_eq!(ix.committed_count(), 0);
        assert_eq!(ix.uncommitted_count(), 0);
        assert!(!ix.in_transaction());

        // 之后的事务不受影响
        let mut tx = ix.start_transaction().unwrap();
        tx.add(person(3, "c")).unwrap();
        tx.commit().unwrap();
        assert_eq!(ix.committed_count(), 1);
    }

    #[test]
    fn nested_commit_only_pops_depth() {
        let mut ix = Indexer::<Person>::in_memory();
        let mut outer = ix.start_transaction().unwrap();
        outer.add(person(1, "a")).unwrap();
        let mut inner = outer.start_nested();
        inner.add(person(2, "b")).unwrap();
        assert_eq!(inner.depth(), 2);
        inner.commit().unwrap();
        assert_eq!(outer.depth(), 1);
        assert_eq!(outer.committed_count(), 0);
        outer.commit().unwrap();
        assert_eq!(ix.committed_count(), 2);
    }

    #[test]
    fn empty_commit_skips_indexes() {
        let mut ix = Indexer::<Person>::in_memory();
        let calls = Arc::new(AtomicU64::new(0));
        ix.add_index(Flaky::new(&Arc::new(AtomicBool::new(false)), &calls))
            .unwrap();

        ix.start_transaction().unwrap().commit().unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
        assert!(!ix.in_transaction());

        let mut tx = ix.start_transaction().unwrap();
        tx.add(person(1, "a")).unwrap();
        tx.commit().unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        {
            let mut outer = ix.start_transaction().unwrap();
            outer.start_nested().commit().unwrap();
            outer.commit().unwrap();
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(ix.committed_count(), 1);
    }

    #[test]
    fn dropping_guard_rolls_back() {
        let mut ix = Indexer::<Person>::in_memory();
        {
            let mut tx = ix.start_transaction().unwrap();
            tx.add(person(1, "a")).unwrap();
        }
        assert_eq!(ix.committed_count(), 0);
        assert_eq!(ix.all_items().count(), 0);
    }

    #[test]
    fn index_added_later_sees_existing_items() {
        let mut ix = Indexer::<Person>::in_memory();
        let mut tx = ix.start_transaction().unwrap();
        for (i, c) in ["x", "y", "x"].iter().enumerate() {
            tx.add(person(i as i64, c)).unwrap();
        }
        tx.commit().unwrap();

        ix.add_equality_index("city", |p: &Person| p.city.clone()).unwrap();
        ix.add_ordered_index("id", |p: &Person| p.id).unwrap();
        assert_eq!(ix.index_names(), vec!["city", "id"]);

        let city = ix.equality_index::<String>("city").unwrap();
        assert_eq!(city.items("x".to_string()).count(), 2);
        let id = ix.ordered_index::<i64>("id").unwrap();
        assert_eq!(id.len(), 3);
    }

    #[test]
    fn lookups_validate_name_and_type() {
        let mut ix = Indexer::<Person>::in_memory();
        ix.add_ordered_index("id", |p: &Person| p.id).unwrap();
        assert!(matches!(
            ix.add_ordered_index("id", |p: &Person| p.id),
            Err(Error::DuplicateIndex(_))
        ));
        assert!(matches!(
            ix.equality_index::<i64>("id"),
            Err(Error::IndexTypeMismatch { .. })
        ));
        assert!(matches!(
            ix.ordered_index::<String>("id"),
            Err(Error::IndexTypeMismatch { .. })
        ));
        assert!(matches!(
            ix.ordered_index::<i64>("nope"),
            Err(Error::IndexNotFound(_))
        ));
        ix.remove_index("id").unwrap();
        assert!(ix.index_names().is_empty());
    }

    #[test]
    fn failed_commit_rolls_back_and_rebuilds() {
        let fail = Arc::new(AtomicBool::new(false));
        let mut ix = Indexer::<Person>::in_memory();
        ix.add_equality_index("city", |p: &Person| p.city.clone()).unwrap();
        ix.add_index(Flaky::new(&fail, &Arc::new(AtomicU64::new(0))))
            .unwrap();

        let mut tx = ix.start_transaction().unwrap();
        tx.add(person(1, "a")).unwrap();
        tx.commit().unwrap();

        fail.store(true, AtomicOrdering::SeqCst);
        let mut tx = ix.start_transaction().unwrap();
        tx.add(person(2, "a")).unwrap();
        let err = tx.commit().unwrap_err();
        assert!(err.is_environmental());

        assert_eq!(ix.committed_count(), 1);
        assert_eq!(ix.uncommitted_count(), 0);
        let city = ix.equality_index::<String>("city").unwrap();
        let ids: Vec<i64> = city
            .items("a".to_string())
            .map(|p| p.map(|p| p.id))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn dispose_is_idempotent() {
        let mut ix = Indexer::<Person>::in_memory();
        ix.add_ordered_index("id", |p: &Person| p.id).unwrap();
        ix.dispose().unwrap();
        ix.dispose().unwrap();
        assert!(matches!(ix.start_transaction(), Err(Error::Disposed(_))));
        assert!(matches!(
            ix.ordered_index::<i64>("id"),
            Err(Error::Disposed(_))
        ));
    }
}
