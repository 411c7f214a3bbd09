use crate::array::{BigList, Iter};
use crate::core::Result;
use crate::index::Indexer;

/// 事务守卫。
///
/// `commit` / `rollback` 消耗守卫；未结束就被 drop 的守卫按回滚处理。
/// 嵌套事务通过 [`Transaction::start_nested`] 开启，它借用外层守卫。
pub struct Transaction<'a, T: Clone + Send + Sync + 'static> {
    indexer: &'a mut Indexer<T>,
    finished: bool,
}

impl<'a, T: Clone + Send + Sync + 'static> Transaction<'a, T> {
    pub(crate) fn new(indexer: &'a mut Indexer<T>) -> Self {
        Self {
            indexer,
            finished: false,
        }
    }

    /// 追加一个元素（无论嵌套多深都直接进入元素列表），返回它的位置。
    pub fn add(&mut self, item: T) -> Result<u64> {
        self.indexer.items.push(item)
    }

    pub fn start_nested(&mut self) -> Transaction<'_, T> {
        self.indexer.depth += 1;
        Transaction::new(self.indexer)
    }

    /// 最外层：按登记顺序让每个索引提交新区间，然后推进已提交计数。
    /// 若有内层请求过回滚，则整体回滚并返回 `RollbackRequested`。
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.indexer.commit_level()
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.indexer.rollback_level()
    }

    pub fn depth(&self) -> u32 {
        self.indexer.depth
    }

    pub fn was_rollback_requested(&self) -> bool {
        self.indexer.must_rollback
    }

    pub fn committed_count(&self) -> u64 {
        self.indexer.committed
    }

    pub fn uncommitted_count(&self) -> u64 {
        self.indexer.uncommitted_count()
    }

    pub fn all_items(&self) -> Iter<'_, T, BigList<T>> {
        self.indexer.all_items()
    }

    pub fn uncommitted_items(&self) -> Iter<'_, T, BigList<T>> {
        self.indexer.uncommitted_items()
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for Transaction<'_, T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.indexer.rollback_level() {
            tracing::warn!("Rollback of abandoned transaction failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::Result;
    use crate::index::Indexer;

    #[test]
    fn uncommitted_items_visible_only_inside_transaction() {
        let mut ix = Indexer::<i64>::in_memory();
        let mut tx = ix.start_transaction().unwrap();
        tx.add(10).unwrap();
        tx.add(20).unwrap();
        let pending: Vec<i64> = tx.uncommitted_items().collect::<Result<_>>().unwrap();
        assert_eq!(pending, vec![10, 20]);
        assert_eq!(tx.committed_count(), 0);
        tx.commit().unwrap();

        let mut tx = ix.start_transaction().unwrap();
        tx.add(30).unwrap();
        let all: Vec<i64> = tx.all_items().collect::<Result<_>>().unwrap();
        assert_eq!(all, vec![10, 20, 30]);
        tx.rollback().unwrap();
        assert_eq!(ix.committed_items().count(), 2);
    }

    #[test]
    fn dropped_nested_guard_requests_rollback() {
        let mut ix = Indexer::<i64>::in_memory();
        let mut outer = ix.start_transaction().unwrap();
        outer.add(1).unwrap();
        {
            let mut inner = outer.start_nested();
            inner.add(2).unwrap();
        }
        assert!(outer.was_rollback_requested());
        assert_eq!(outer.depth(), 1);
        assert!(outer.commit().is_err());
        assert_eq!(ix.committed_count(), 0);
    }
}
