use crate::array::sort::{sort_parallel, SortSlots, SplitSlots};
use crate::array::{IndexableArray, TryCompare};
use crate::core::config::{self, EngineConfig};
use crate::core::error::{check_index, check_range};
use crate::core::{Error, Result};

const WHAT: &str = "InMemoryArray";

/// 分段的内存数组。
///
/// 段在第一次写入时才分配；未分配的段读到默认值。
/// 最后一段按余数定长。`resize` 只重排段目录，已有段保持原样（边界段按新长度截断 / 补齐）。
pub struct InMemoryArray<T> {
    segments: Vec<Option<Box<[T]>>>,
    len: u64,
    segment_length: usize,
    default: T,
    sort_threshold: u64,
    disposed: bool,
}

impl<T: Clone + Send + Sync> InMemoryArray<T> {
    pub fn new(len: u64, default: T) -> Self {
        Self::with_config(len, default, &config::global())
    }

    pub fn with_config(len: u64, default: T, cfg: &EngineConfig) -> Self {
        let segment_length = cfg.segment_length.max(1);
        Self {
            segments: std::iter::repeat_with(|| None)
                .take(len.div_ceil(segment_length as u64) as usize)
                .collect(),
            len,
            segment_length,
            default,
            sort_threshold: cfg.parallel_sort_threshold,
            disposed: false,
        }
    }

    pub fn segment_length(&self) -> usize {
        self.segment_length
    }

    /// 已分配的段数
    pub fn allocated_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.is_some()).count()
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed(WHAT));
        }
        Ok(())
    }

    fn locate(&self, index: u64) -> (usize, usize) {
        let seg = self.segment_length as u64;
        ((index / seg) as usize, (index % seg) as usize)
    }

    /// 长度 `len` 的数组里第 `k` 段应有的长度
    fn expected_segment_len(len: u64, segment_length: usize, k: usize) -> usize {
        let start = k as u64 * segment_length as u64;
        (segment_length as u64).min(len.saturating_sub(start)) as usize
    }

    fn fit_segment(&mut self, k: usize) {
        let want = Self::expected_segment_len(self.len, self.segment_length, k);
        let default = &self.default;
        if let Some(Some(seg)) = self.segments.get_mut(k) {
            if seg.len() != want {
                let mut v = std::mem::take(seg).into_vec();
                v.resize(want, default.clone());
                *seg = v.into_boxed_slice();
            }
        }
    }

    /// `[start, start + count)` 上的排序视图；区间内缺失的段先物化。
    fn slots(&mut self, start: u64, count: u64) -> SegmentSlots<'_, T> {
        let seg = self.segment_length as u64;
        if count == 0 {
            return SegmentSlots::empty(seg);
        }
        let end = start + count;
        let first = (start / seg) as usize;
        let last = ((end - 1) / seg) as usize;
        let (len, segment_length) = (self.len, self.segment_length);
        let default = &self.default;

        let mut pieces: Vec<&mut [T]> = Vec::with_capacity(last - first + 1);
        for (k, slot) in self
            .segments
            .iter_mut()
            .enumerate()
            .skip(first)
            .take(last - first + 1)
        {
            let seg_len = Self::expected_segment_len(len, segment_length, k);
            let data = slot.get_or_insert_with(|| vec![default.clone(); seg_len].into_boxed_slice());
            let seg_start = k as u64 * seg;
            let lo = (start.max(seg_start) - seg_start) as usize;
            let hi = (end.min(seg_start + seg_len as u64) - seg_start) as usize;
            pieces.push(&mut data[lo..hi]);
        }

        let first_len = pieces.first().map_or(0, |p| p.len() as u64);
        SegmentSlots {
            pieces,
            first_len,
            segment_length: seg,
            len: count,
        }
    }
}

impl<T: Clone + Send + Sync> IndexableArray<T> for InMemoryArray<T> {
    fn len(&self) -> u64 {
        self.len
    }

    fn get(&self, index: u64) -> Result<T> {
        self.check_live()?;
        check_index(index, self.len)?;
        let (k, off) = self.locate(index);
        Ok(match &self.segments[k] {
            Some(seg) => seg[off].clone(),
            None => self.default.clone(),
        })
    }

    fn set(&mut self, index: u64, value: T) -> Result<()> {
        self.check_live()?;
        check_index(index, self.len)?;
        let (k, off) = self.locate(index);
        let seg_len = Self::expected_segment_len(self.len, self.segment_length, k);
        let default = &self.default;
        let seg = self.segments[k]
            .get_or_insert_with(|| vec![default.clone(); seg_len].into_boxed_slice());
        seg[off] = value;
        Ok(())
    }

    fn resize(&mut self, new_len: u64) -> Result<()> {
        self.check_live()?;
        if new_len == self.len {
            return Ok(());
        }
        let old_count = self.segments.len();
        let new_count = new_len.div_ceil(self.segment_length as u64) as usize;
        self.segments.truncate(new_count);
        self.segments.resize_with(new_count, || None);
        self.len = new_len;

        // 边界段：旧的最后一段（增长时补齐）与新的最后一段（收缩时截断）
        if old_count > 0 {
            self.fit_segment(old_count - 1);
        }
        if new_count > 0 {
            self.fit_segment(new_count - 1);
        }
        Ok(())
    }

    fn create_new(&self, len: u64) -> Result<Self> {
        Ok(Self {
            segments: std::iter::repeat_with(|| None)
                .take(len.div_ceil(self.segment_length as u64) as usize)
                .collect(),
            len,
            segment_length: self.segment_length,
            default: self.default.clone(),
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
        let threshold = self.sort_threshold;
        sort_parallel(self.slots(start, count), cmp, threshold)
    }

    fn dispose(&mut self) -> Result<()> {
        self.segments = Vec::new();
        self.disposed = true;
        Ok(())
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}

/// 跨段的排序视图：第一片可能从段中间开始，中间各片都是整段。
pub(crate) struct SegmentSlots<'a, T> {
    pieces: Vec<&'a mut [T]>,
    first_len: u64,
    segment_length: u64,
    len: u64,
}

impl<T> SegmentSlots<'_, T> {
    fn empty(segment_length: u64) -> Self {
        Self {
            pieces: Vec::new(),
            first_len: 0,
            segment_length,
            len: 0,
        }
    }

    fn locate(&self, i: u64) -> (usize, usize) {
        if i < self.first_len {
            return (0, i as usize);
        }
        let j = i - self.first_len;
        (
            1 + (j / self.segment_length) as usize,
            (j % self.segment_length) as usize,
        )
    }
}

impl<T: Clone> SortSlots<T> for SegmentSlots<'_, T> {
    fn len(&self) -> u64 {
        self.len
    }

    fn read(&self, i: u64) -> Result<T> {
        check_index(i, self.len)?;
        let (p, o) = self.locate(i);
        Ok(self.pieces[p][o].clone())
    }

    fn swap(&mut self, a: u64, b: u64) -> Result<()> {
        check_index(a, self.len)?;
        check_index(b, self.len)?;
        let (pa, oa) = self.locate(a);
        let (pb, ob) = self.locate(b);
        if pa == pb {
            self.pieces[pa].swap(oa, ob);
            return Ok(());
        }
        let ((lp, lo), (hp, ho)) = if pa < pb {
            ((pa, oa), (pb, ob))
        } else {
            ((pb, ob), (pa, oa))
        };
        let (left, right) = self.pieces.split_at_mut(hp);
        std::mem::swap(&mut left[lp][lo], &mut right[0][ho]);
        Ok(())
    }
}

impl<T: Clone + Send> SplitSlots<T> for SegmentSlots<'_, T> {
    fn split_at(self, mid: u64) -> (Self, Self) {
        let seg = self.segment_length;
        if mid == 0 {
            return (Self::empty(seg), self);
        }
        if mid >= self.len {
            return (self, Self::empty(seg));
        }

        let (p, o) = self.locate(mid);
        let piece_len = self.pieces[p].len() as u64;
        let left_first = if p == 0 { o as u64 } else { self.first_len };
        let total = self.len;

        let mut left = Vec::with_capacity(p + 1);
        let mut right = Vec::with_capacity(self.pieces.len() - p);
        for (k, piece) in self.pieces.into_iter().enumerate() {
            if k < p {
                left.push(piece);
            } else if k == p {
                let (a, b) = piece.split_at_mut(o);
                if !a.is_empty() {
                    left.push(a);
                }
                right.push(b);
            } else {
                right.push(piece);
            }
        }

        (
            Self {
                pieces: left,
                first_len: left_first,
                segment_length: seg,
                len: mid,
            },
            Self {
                pieces: right,
                first_len: piece_len - o as u64,
                segment_length: seg,
                len: total - mid,
            },
        )
    }
}
