//! 有界并行 quicksort（Lomuto 分区，取中间元素为枢轴）。
//!
//! 分区后左半段满足阈值且全局 worker 数未达 CPU 数时交给 rayon worker，
//! 右半段总是在当前线程上继续（尾调用式循环）。worker 的失败被收集，
//! 顶层在所有 worker 结束后一次性返回 `SortFailed`。

use std::cmp::Ordering;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use parking_lot::Mutex;

use crate::array::TryCompare;
use crate::core::{Error, Result};
use crate::stats::{Counters, COUNTERS};

/// 进程内正在执行排序分区的 worker 数
static ACTIVE_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// 排序视图：区间内的可读写槽位，下标从 0 开始。
pub(crate) trait SortSlots<T> {
    fn len(&self) -> u64;
    fn read(&self, i: u64) -> Result<T>;
    fn swap(&mut self, a: u64, b: u64) -> Result<()>;
}

/// 可以切成两段互不重叠视图的排序视图（并行排序需要）。
pub(crate) trait SplitSlots<T>: SortSlots<T> + Send + Sized {
    fn split_at(self, mid: u64) -> (Self, Self);
}

/// 占用一个 worker 名额；drop 时归还。
struct WorkerSlot;

impl WorkerSlot {
    fn try_acquire() -> Option<Self> {
        let now = ACTIVE_WORKERS.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        if now >= num_cpus::get() {
            ACTIVE_WORKERS.fetch_sub(1, AtomicOrdering::AcqRel);
            return None;
        }
        Some(WorkerSlot)
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        ACTIVE_WORKERS.fetch_sub(1, AtomicOrdering::AcqRel);
    }
}

/// 对 `[lo, hi)` 做一次 Lomuto 分区，返回枢轴最终位置。
fn partition<T, S>(slots: &mut S, lo: u64, hi: u64, cmp: TryCompare<'_, T>) -> Result<u64>
where
    S: SortSlots<T> + ?Sized,
{
    let last = hi - 1;
    let mid = lo + (last - lo) / 2;
    let pivot = slots.read(mid)?;
    slots.swap(mid, last)?;

    let mut store = lo;
    for i in lo..last {
        if cmp(&slots.read(i)?, &pivot)? == Ordering::Less {
            if i != store {
                slots.swap(i, store)?;
            }
            store += 1;
        }
    }
    slots.swap(store, last)?;
    Ok(store)
}

/// 并行排序整个视图。阻塞到所有 worker 结束。
pub(crate) fn sort_parallel<T, S>(slots: S, cmp: TryCompare<'_, T>, threshold: u64) -> Result<()>
where
    S: SplitSlots<T>,
{
    Counters::bump(&COUNTERS.sorts, 1);
    let failures: Mutex<Vec<Error>> = Mutex::new(Vec::new());

    let caller = catch_unwind(AssertUnwindSafe(|| {
        rayon::scope(|scope| run(scope, slots, cmp, threshold.max(2), &failures));
    }));
    let mut failures = failures.into_inner();
    if let Err(payload) = caller {
        failures.push(Error::WorkerPanicked(panic_message(payload.as_ref())));
    }

    if failures.is_empty() {
        return Ok(());
    }
    tracing::debug!("Parallel sort finished with {} failure(s)", failures.len());
    Err(Error::SortFailed(failures))
}

fn run<'s, T, S>(
    scope: &rayon::Scope<'s>,
    mut slots: S,
    cmp: TryCompare<'s, T>,
    threshold: u64,
    failures: &'s Mutex<Vec<Error>>,
) where
    T: 's,
    S: SplitSlots<T> + 's,
{
    while slots.len() >= 2 {
        let n = slots.len();
        let p = match partition(&mut slots, 0, n, cmp) {
            Ok(p) => p,
            Err(e) => {
                failures.lock().push(e);
                return;
            }
        };

        let (left, rest) = slots.split_at(p);
        let (_pivot, right) = rest.split_at(1);

        if left.len() >= 2 {
            let slot = if left.len() >= threshold {
                WorkerSlot::try_acquire()
            } else {
                None
            };
            match slot {
                Some(slot) => {
                    Counters::bump(&COUNTERS.partitions_offloaded, 1);
                    scope.spawn(move |s| {
                        let _slot = slot;
                        let r = catch_unwind(AssertUnwindSafe(|| {
                            run(s, left, cmp, threshold, failures)
                        }));
                        if let Err(payload) = r {
                            failures
                                .lock()
                                .push(Error::WorkerPanicked(panic_message(payload.as_ref())));
                        }
                    });
                }
                None => {
                    Counters::bump(&COUNTERS.partitions_inline, 1);
                    run(scope, left, cmp, threshold, failures);
                }
            }
        }
        slots = right;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    /// `&mut [T]` 上的最简视图
    struct SliceSlots<'a, T>(&'a mut [T]);

    impl<T: Clone> SortSlots<T> for SliceSlots<'_, T> {
        fn len(&self) -> u64 {
            self.0.len() as u64
        }

        fn read(&self, i: u64) -> Result<T> {
            Ok(self.0[i as usize].clone())
        }

        fn swap(&mut self, a: u64, b: u64) -> Result<()> {
            self.0.swap(a as usize, b as usize);
            Ok(())
        }
    }

    impl<T: Clone + Send> SplitSlots<T> for SliceSlots<'_, T> {
        fn split_at(self, mid: u64) -> (Self, Self) {
            let (a, b) = self.0.split_at_mut(mid as usize);
            (SliceSlots(a), SliceSlots(b))
        }
    }

    fn random_vec(n: usize, seed: u64, modulo: i64) -> Vec<i64> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(0..modulo)).collect()
    }

    #[test]
    fn matches_std_sort_below_and_above_threshold() {
        for (n, modulo) in [(0usize, 10), (1, 10), (17, 5), (9_999, 1_000), (50_000, 1_000_000)] {
            let mut v = random_vec(n, n as u64, modulo);
            let mut expected = v.clone();
            expected.sort();
            sort_parallel(SliceSlots(&mut v), &|a: &i64, b: &i64| Ok(a.cmp(b)), 10_000).unwrap();
            assert_eq!(v, expected, "n={n}");
        }
    }

    #[test]
    fn sorts_subrange_only() {
        let mut v = vec![9i64, 8, 7, 6, 5, 4, 3, 2, 1];
        sort_parallel(SliceSlots(&mut v[2..7]), &|a: &i64, b: &i64| Ok(a.cmp(b)), 2).unwrap();
        assert_eq!(v, vec![9, 8, 3, 4, 5, 6, 7, 2, 1]);
    }

    #[test]
    fn presorted_and_constant_inputs() {
        let mut asc: Vec<i64> = (0..30_000).collect();
        sort_parallel(SliceSlots(&mut asc), &|a: &i64, b: &i64| Ok(b.cmp(a)), 1_000).unwrap();
        assert!(asc.windows(2).all(|w| w[0] >= w[1]));

        let mut same = vec![7i64; 5_000];
        sort_parallel(SliceSlots(&mut same), &|a: &i64, b: &i64| Ok(a.cmp(b)), 1_000).unwrap();
        assert!(same.iter().all(|v| *v == 7));
    }

    #[test]
    fn comparator_failures_are_aggregated() {
        let mut v = random_vec(40_000, 3, 100);
        let err = sort_parallel(
            SliceSlots(&mut v),
            &|a: &i64, b: &i64| {
                if *a == 42 || *b == 42 {
                    return Err(Error::invalid("item", "unsortable"));
                }
                Ok(a.cmp(b))
            },
            1_000,
        )
        .unwrap_err();
        match err {
            Error::SortFailed(errors) => {
                assert!(!errors.is_empty());
                assert!(errors
                    .iter()
                    .all(|e| matches!(e, Error::InvalidArgument { .. })));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn comparator_panic_becomes_error() {
        let mut v = random_vec(20_000, 9, 1_000);
        let err = sort_parallel(
            SliceSlots(&mut v),
            &|a: &i64, b: &i64| {
                if *a == 500 {
                    panic!("boom");
                }
                Ok(a.cmp(b))
            },
            1_000,
        )
        .unwrap_err();
        match err {
            Error::SortFailed(errors) => assert!(errors
                .iter()
                .any(|e| matches!(e, Error::WorkerPanicked(m) if m.contains("boom")))),
            other => panic!("unexpected error: {other}"),
        }
    }
}
