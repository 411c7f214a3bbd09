//! 事务性索引器与它的两种索引（等值哈希 / 有序）。

pub mod equality;
pub mod indexer;
pub mod node;
pub mod ordered;
pub mod transaction;

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::array::BigList;
use crate::core::{Error, Result};

pub use equality::{EqualityIndex, EqualityItems, EqualityView};
pub use indexer::Indexer;
pub use node::Node;
pub use ordered::{OrderedIndex, OrderedItems, OrderedView};
pub use transaction::Transaction;

/// 存储模式：索引器构造时选定，并传给它创建的所有索引。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    InMemory,
    MemoryMapped,
    RandomAccessFile,
}

impl StorageMode {
    pub const ALL: [StorageMode; 3] = [
        StorageMode::InMemory,
        StorageMode::MemoryMapped,
        StorageMode::RandomAccessFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::InMemory => "in-memory",
            StorageMode::MemoryMapped => "memory-mapped",
            StorageMode::RandomAccessFile => "random-access-file",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StorageMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::invalid("mode", format!("unknown storage mode `{s}`")))
    }
}

/// 挂在索引器上的索引。
///
/// 索引器在提交时按登记顺序调用 `committing`；`[from, to)` 是本次新提交的区间，
/// `items` 是完整的元素列表（`to == items.len()`）。
pub trait Index<T>: Send + Sync {
    fn name(&self) -> &str;

    fn storage_mode(&self) -> StorageMode;

    fn committing(&mut self, items: &BigList<T>, from: u64, to: u64) -> Result<()>;

    /// 丢弃全部结构，回到“从未提交过”的状态。
    fn reset(&mut self) -> Result<()>;

    fn dispose(&mut self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// 等值索引的键比较器
pub trait KeyComparer<K>: Send + Sync {
    fn hash_code(&self, key: &K) -> i32;
    fn equals(&self, a: &K, b: &K) -> bool;
}

/// `Hash + Eq` 键：xxh3 哈希折叠到 32 位。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultKeyComparer;

impl<K: Hash + Eq> KeyComparer<K> for DefaultKeyComparer {
    fn hash_code(&self, key: &K) -> i32 {
        let mut h = Xxh3::new();
        key.hash(&mut h);
        let v = h.finish();
        (v ^ (v >> 32)) as i32
    }

    fn equals(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// 可空键：`None` 固定哈希到 `i32::MIN`，其余交给内层比较器。
#[derive(Clone, Copy, Debug, Default)]
pub struct NullableKeyComparer<C>(pub C);

pub const NULL_KEY_HASH: i32 = i32::MIN;

impl<K, C: KeyComparer<K>> KeyComparer<Option<K>> for NullableKeyComparer<C> {
    fn hash_code(&self, key: &Option<K>) -> i32 {
        match key {
            Some(k) => self.0.hash_code(k),
            None => NULL_KEY_HASH,
        }
    }

    fn equals(&self, a: &Option<K>, b: &Option<K>) -> bool {
        match (a, b) {
            (Some(x), Some(y)) => self.0.equals(x, y),
            (None, None) => true,
            _ => false,
        }
    }
}

const CLUSTER_PRIMES: [u64; 9] = [3, 5, 7, 11, 13, 17, 19, 29, 31];

/// 桶数：不小于 `n`（且不小于 31）的奇数，且不含上面这些小素因子。
pub fn adapt_length(n: u64) -> u64 {
    let mut c = n.max(31);
    if c % 2 == 0 {
        c += 1;
    }
    while CLUSTER_PRIMES.iter().any(|p| c % p == 0) {
        c += 2;
    }
    c
}
