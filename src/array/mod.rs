//! 64 位下标的数组抽象与三种存储后端。
//!
//! 排序 / 二分查找是共享算法，按 trait 泛型实现，不依赖具体后端。

pub mod any;
pub mod file;
pub mod in_memory;
pub mod list;
pub mod mapped;
pub mod sort;

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::core::error::check_range;
use crate::core::Result;

pub use any::{AnyArray, ArraySpec};
pub use file::FileArray;
pub use in_memory::InMemoryArray;
pub use list::BigList;
pub use mapped::MappedArray;

/// 可失败的比较器（磁盘后端的读取可能失败）
pub type TryCompare<'a, T> = &'a (dyn Fn(&T, &T) -> Result<Ordering> + Sync);

/// 定长、64 位下标的数组。
///
/// 越界访问一律返回 `OutOfRange`；`resize(0)` 总是合法。
pub trait IndexableArray<T>: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: u64) -> Result<T>;

    fn set(&mut self, index: u64, value: T) -> Result<()>;

    fn swap(&mut self, a: u64, b: u64) -> Result<()> {
        let va = self.get(a)?;
        let vb = self.get(b)?;
        self.set(a, vb)?;
        self.set(b, va)
    }

    /// 改变长度，保留重叠部分。
    fn resize(&mut self, new_len: u64) -> Result<()>;

    /// 同后端、同配置的新数组。
    fn create_new(&self, len: u64) -> Result<Self>
    where
        Self: Sized;

    /// 在 `[start, start + count)` 内线性查找。
    fn index_of(&self, item: &T, start: u64, count: u64) -> Result<Option<u64>>
    where
        T: PartialEq,
    {
        check_range(start, count, self.len())?;
        for i in start..start + count {
            if self.get(i)? == *item {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn contains(&self, item: &T) -> Result<bool>
    where
        T: PartialEq,
    {
        Ok(self.index_of(item, 0, self.len())?.is_some())
    }

    /// 见 [`try_binary_search_by`]。
    fn binary_search_by<F>(&self, start: u64, count: u64, mut f: F) -> Result<i64>
    where
        F: FnMut(&T) -> Ordering,
        Self: Sized,
    {
        try_binary_search_by(self, start, count, |v| Ok(f(v)))
    }

    fn try_binary_search_by<F>(&self, start: u64, count: u64, f: F) -> Result<i64>
    where
        F: FnMut(&T) -> Result<Ordering>,
        Self: Sized,
    {
        try_binary_search_by(self, start, count, f)
    }

    /// 对 `[start, start + count)` 排序（不稳定）。
    fn try_sort_by(&mut self, start: u64, count: u64, cmp: TryCompare<'_, T>) -> Result<()>;

    fn sort_by<F>(&mut self, start: u64, count: u64, cmp: F) -> Result<()>
    where
        F: Fn(&T, &T) -> Ordering + Sync,
        Self: Sized,
    {
        self.try_sort_by(start, count, &|a: &T, b: &T| Ok(cmp(a, b)))
    }

    fn iter(&self) -> Iter<'_, T, Self>
    where
        Self: Sized,
    {
        Iter::new(self, 0, self.len())
    }

    /// 释放后备存储。幂等；之后的访问返回 `Disposed`。
    fn dispose(&mut self) -> Result<()>;

    fn is_disposed(&self) -> bool;
}

/// 在已排序区间内二分查找。
///
/// `f` 返回元素相对目标的顺序（与 `slice::binary_search_by` 相同）。
/// 找到时返回下标（重复键时是其中任意一个），否则返回插入点的按位取反。
pub fn try_binary_search_by<T, A, F>(array: &A, start: u64, count: u64, mut f: F) -> Result<i64>
where
    A: IndexableArray<T> + ?Sized,
    F: FnMut(&T) -> Result<Ordering>,
{
    check_range(start, count, array.len())?;
    let mut lo = start;
    let mut hi = start + count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match f(&array.get(mid)?)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(mid as i64),
        }
    }
    Ok(!(lo as i64))
}

/// 按下标顺序逐个 `get` 的迭代器。
pub struct Iter<'a, T, A: ?Sized> {
    array: &'a A,
    next: u64,
    end: u64,
    _item: PhantomData<fn() -> T>,
}

impl<'a, T, A: IndexableArray<T> + ?Sized> Iter<'a, T, A> {
    pub fn new(array: &'a A, start: u64, end: u64) -> Self {
        Self {
            array,
            next: start,
            end,
            _item: PhantomData,
        }
    }
}

impl<T, A: IndexableArray<T> + ?Sized> Iterator for Iter<'_, T, A> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let i = self.next;
        self.next += 1;
        Some(self.array.get(i))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.end - self.next.min(self.end)) as usize;
        (n, Some(n))
    }
}
