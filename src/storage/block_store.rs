use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tempfile::{NamedTempFile, TempPath};

use crate::core::config::{self, EngineConfig};
use crate::core::{Error, Result};
use crate::stats::{maybe_trim_rss, Counters, COUNTERS};
use crate::storage::pressure::{PressureListener, PressureMonitor};

const WHAT: &str = "BlockStore";

/// 单个块存储的缓存统计
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BlockStoreStats {
    pub length: u64,
    pub cached_blocks: usize,
    pub dirty_blocks: usize,
    pub flushes: u64,
    pub evicted_blocks: u64,
    pub collections: u64,
}

/// 带块缓存的随机访问文件。
///
/// - 所有读写 / 改长度 / flush 共用一把实例锁
/// - 脏块强持有，直到写回磁盘
/// - 干净块按两代时钟回收：一次回收周期内没被碰过的块在下一次回收时丢弃
/// - 回收由内存压力回调触发（超过 guaranteed_memory 才请求），
///   回调在有界等待内抢不到锁时只留下标记，由下一次读写补做
pub struct BlockStore {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    collection_requested: AtomicBool,
    block_size: usize,
    guaranteed_memory: u64,
    lock_wait: Duration,
    flushes: AtomicU64,
    evicted: AtomicU64,
    collections: AtomicU64,
}

struct State {
    /// None == 已释放
    file: Option<File>,
    temp_path: Option<TempPath>,
    writable: bool,
    flush_on_dispose: bool,
    /// 逻辑长度（可能领先于磁盘上的长度）
    length: u64,
    physical_length: u64,
    blocks: HashMap<u64, CachedBlock>,
    dirty: BTreeSet<u64>,
}

struct CachedBlock {
    bytes: Box<[u8]>,
    referenced: bool,
}

impl BlockStore {
    /// 在临时目录下新建一个空的后备文件；释放时删除。
    pub fn create_temp() -> Result<Self> {
        Self::create_temp_with_config(&config::global())
    }

    pub fn create_temp_with_config(cfg: &EngineConfig) -> Result<Self> {
        cfg.validate()?;
        let (file, path) = NamedTempFile::new()?.into_parts();
        let store = Self::from_parts(file, Some(path), true, 0, cfg);
        store.attach_monitor(PressureMonitor::global());
        Ok(store)
    }

    /// 打开已有文件。只读打开时所有写操作返回 `InvalidArgument`。
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        Self::open_with_config(path, writable, &config::global())
    }

    pub fn open_with_config(path: &Path, writable: bool, cfg: &EngineConfig) -> Result<Self> {
        cfg.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(path)?;
        let length = file.metadata()?.len();
        let store = Self::from_parts(file, None, writable, length, cfg);
        store.attach_monitor(PressureMonitor::global());
        Ok(store)
    }

    fn from_parts(
        file: File,
        temp_path: Option<TempPath>,
        writable: bool,
        length: u64,
        cfg: &EngineConfig,
    ) -> Self {
        Counters::bump(&COUNTERS.block_stores_opened, 1);
        tracing::debug!(
            "BlockStore opened: len={} block_size={} writable={} temp={}",
            length,
            cfg.block_size,
            writable,
            temp_path.is_some()
        );
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    file: Some(file),
                    temp_path,
                    writable,
                    flush_on_dispose: true,
                    length,
                    physical_length: length,
                    blocks: HashMap::new(),
                    dirty: BTreeSet::new(),
                }),
                collection_requested: AtomicBool::new(false),
                block_size: cfg.block_size,
                guaranteed_memory: cfg.guaranteed_memory_bytes,
                lock_wait: cfg.pressure_lock_wait(),
                flushes: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                collections: AtomicU64::new(0),
            }),
        }
    }

    /// 向监视器登记（弱引用）；可以登记到多个监视器。
    pub fn attach_monitor(&self, monitor: &Arc<PressureMonitor>) {
        let listener: Arc<dyn PressureListener> = self.shared.clone();
        monitor.register(Arc::downgrade(&listener));
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.enter()?.length)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_writable(&self) -> bool {
        self.shared.state.lock().writable
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().file.is_none()
    }

    /// 改变逻辑长度。收缩时丢弃新末尾之后的缓存内容，之后再增长读到的是 0。
    pub fn set_len(&self, new_len: u64) -> Result<()> {
        let mut st = self.enter()?;
        st.check_writable()?;
        if new_len < st.length {
            let bs = self.shared.block_size as u64;
            let first_dead = new_len.div_ceil(bs);
            st.blocks.retain(|&i, _| i < first_dead);
            st.dirty.retain(|&i| i < first_dead);
            let tail = (new_len % bs) as usize;
            if tail != 0 {
                if let Some(b) = st.blocks.get_mut(&(new_len / bs)) {
                    b.bytes[tail..].fill(0);
                }
            }
            if st.physical_length > new_len {
                if let Some(f) = st.file.as_mut() {
                    f.set_len(new_len)?;
                }
                st.physical_length = new_len;
            }
        }
        st.length = new_len;
        Ok(())
    }

    /// 读一个字节；`offset >= len` 时越界。
    pub fn read_byte(&self, offset: u64) -> Result<u8> {
        let mut st = self.enter()?;
        crate::core::error::check_index(offset, st.length)?;
        let mut b = [0u8; 1];
        st.read_within_block(self.shared.block_size, &mut b, offset)?;
        Ok(b[0])
    }

    pub fn write_byte(&self, offset: u64, value: u8) -> Result<()> {
        let mut st = self.enter()?;
        st.check_writable()?;
        st.write_within_block(self.shared.block_size, &[value], offset)?;
        Ok(())
    }

    /// 至多读到当前块末尾（或文件末尾），返回实际字节数；`offset >= len` 时返回 0。
    pub fn read_partial(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_count(buf.len())?;
        let mut st = self.enter()?;
        st.read_within_block(self.shared.block_size, buf, offset)
    }

    /// 读满 `buf`，否则返回 `IncompleteIo`。
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        check_count(buf.len())?;
        end_offset(offset, buf.len())?;
        let mut st = self.enter()?;
        let mut done = 0usize;
        while done < buf.len() {
            let at = offset + done as u64;
            let n = st.read_within_block(self.shared.block_size, &mut buf[done..], at)?;
            if n == 0 {
                return Err(Error::IncompleteIo {
                    op: "read",
                    offset,
                    requested: buf.len(),
                    done,
                });
            }
            done += n;
        }
        Ok(())
    }

    /// 至多写到当前块末尾，返回实际字节数；写过末尾会扩展逻辑长度。
    pub fn write_partial(&self, buf: &[u8], offset: u64) -> Result<usize> {
        check_count(buf.len())?;
        let mut st = self.enter()?;
        st.check_writable()?;
        st.write_within_block(self.shared.block_size, buf, offset)
    }

    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        check_count(buf.len())?;
        end_offset(offset, buf.len())?;
        let mut st = self.enter()?;
        st.check_writable()?;
        let mut done = 0usize;
        while done < buf.len() {
            let at = offset + done as u64;
            let n = st.write_within_block(self.shared.block_size, &buf[done..], at)?;
            if n == 0 {
                return Err(Error::IncompleteIo {
                    op: "write",
                    offset,
                    requested: buf.len(),
                    done,
                });
            }
            done += n;
        }
        Ok(())
    }

    /// 按文件偏移升序写回全部脏块，再把文件长度对齐到逻辑长度。
    pub fn flush(&self) -> Result<()> {
        let mut st = self.enter()?;
        self.shared.write_back(&mut st)
    }

    pub fn set_flush_on_dispose(&self, flush: bool) {
        self.shared.state.lock().flush_on_dispose = flush;
    }

    /// 宿主直接推送一个进程内存读数（与监视器回调同一路径）。
    pub fn on_memory_pressure(&self, process_bytes: u64) {
        self.shared.on_memory_pressure(process_bytes);
    }

    /// 模拟一次压力触发（忽略阈值）：立即 flush 并回收未被引用的干净块。
    pub fn request_collection(&self) -> Result<()> {
        self.shared.collection_requested.store(true, Ordering::Release);
        let mut st = self.shared.state.lock();
        st.check_open()?;
        self.shared.collect_if_requested(&mut st)
    }

    pub fn stats(&self) -> BlockStoreStats {
        let st = self.shared.state.lock();
        BlockStoreStats {
            length: st.length,
            cached_blocks: st.blocks.len(),
            dirty_blocks: st.dirty.len(),
            flushes: self.shared.flushes.load(Ordering::Relaxed),
            evicted_blocks: self.shared.evicted.load(Ordering::Relaxed),
            collections: self.shared.collections.load(Ordering::Relaxed),
        }
    }

    /// 最终 flush（除非关闭了 flush_on_dispose），关闭文件并删除临时文件。幂等。
    pub fn dispose(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        if st.file.is_none() {
            return Ok(());
        }

        let flushed = if st.flush_on_dispose && st.writable {
            self.shared.write_back(&mut st)
        } else {
            Ok(())
        };
        st.blocks.clear();
        st.dirty.clear();
        st.file = None;
        let deleted = match st.temp_path.take() {
            Some(p) => p.close().map_err(Error::from),
            None => Ok(()),
        };

        Counters::bump(&COUNTERS.block_stores_disposed, 1);
        tracing::debug!("BlockStore disposed: len={}", st.length);
        flushed.and(deleted)
    }

    /// 取锁；若有挂起的回收请求，先补做回收。
    fn enter(&self) -> Result<MutexGuard<'_, State>> {
        let mut st = self.shared.state.lock();
        st.check_open()?;
        self.shared.collect_if_requested(&mut st)?;
        Ok(st)
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!("BlockStore dispose on drop failed: {}", e);
        }
    }
}

impl Shared {
    fn write_back(&self, st: &mut State) -> Result<()> {
        let written = st.write_dirty(self.block_size)?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Counters::bump(&COUNTERS.flushes, 1);
        Counters::bump(&COUNTERS.blocks_written, written);
        Ok(())
    }

    fn collect_if_requested(&self, st: &mut State) -> Result<()> {
        if !self.collection_requested.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let flushed = if st.writable {
            self.write_back(st)
        } else {
            Ok(())
        };
        let evicted = st.evict_unreferenced();
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        self.collections.fetch_add(1, Ordering::Relaxed);
        Counters::bump(&COUNTERS.blocks_evicted, evicted as u64);
        Counters::bump(&COUNTERS.collections, 1);

        if evicted > 0 {
            maybe_trim_rss();
        }
        tracing::info!(
            "BlockStore collection: evicted={} remaining={} dirty={}",
            evicted,
            st.blocks.len(),
            st.dirty.len()
        );
        flushed
    }
}

impl PressureListener for Shared {
    fn on_memory_pressure(&self, process_bytes: u64) {
        if process_bytes <= self.guaranteed_memory {
            return;
        }
        if self.collection_requested.swap(true, Ordering::AcqRel) {
            // 已有挂起的请求，交给持锁者处理
            return;
        }

        match self.state.try_lock_for(self.lock_wait) {
            Some(mut st) => {
                if st.file.is_none() {
                    return;
                }
                if let Err(e) = self.collect_if_requested(&mut st) {
                    tracing::warn!("Pressure flush failed, dirty blocks kept: {}", e);
                }
            }
            None => {
                tracing::warn!(
                    "Pressure flush deferred: store busy for {:?}, next access will flush",
                    self.lock_wait
                );
            }
        }
    }
}

impl State {
    fn check_open(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::Disposed(WHAT));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::invalid("store", "opened read-only"));
        }
        Ok(())
    }

    /// 取（必要时从磁盘物化）块 `idx`，并标记为被引用。
    fn block(&mut self, idx: u64, bs: usize) -> Result<&mut CachedBlock> {
        let block = match self.blocks.entry(idx) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => {
                let mut bytes = vec![0u8; bs].into_boxed_slice();
                let pos = idx * bs as u64;
                if pos < self.physical_length {
                    let n = (bs as u64).min(self.physical_length - pos) as usize;
                    let file = self.file.as_mut().ok_or(Error::Disposed(WHAT))?;
                    file.seek(SeekFrom::Start(pos))?;
                    file.read_exact(&mut bytes[..n])?;
                }
                v.insert(CachedBlock {
                    bytes,
                    referenced: true,
                })
            }
        };
        block.referenced = true;
        Ok(block)
    }

    fn read_within_block(&mut self, bs: usize, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.length {
            return Ok(0);
        }
        let within = (offset % bs as u64) as usize;
        let n = buf
            .len()
            .min(bs - within)
            .min((self.length - offset).min(usize::MAX as u64) as usize);
        let block = self.block(offset / bs as u64, bs)?;
        buf[..n].copy_from_slice(&block.bytes[within..within + n]);
        Ok(n)
    }

    fn write_within_block(&mut self, bs: usize, buf: &[u8], offset: u64) -> Result<usize> {
        let within = (offset % bs as u64) as usize;
        let n = buf.len().min(bs - within);
        let end = end_offset(offset, n)?;
        let idx = offset / bs as u64;
        let block = self.block(idx, bs)?;
        block.bytes[within..within + n].copy_from_slice(&buf[..n]);
        self.dirty.insert(idx);
        if end > self.length {
            self.length = end;
        }
        Ok(n)
    }

    /// 升序写回脏块；写失败的块及其后的块保持脏状态。
    fn write_dirty(&mut self, bs: usize) -> Result<u64> {
        let State {
            file,
            blocks,
            dirty,
            length,
            physical_length,
            ..
        } = self;
        let Some(file) = file.as_mut() else {
            return Ok(0);
        };

        let mut written = 0u64;
        while let Some(&idx) = dirty.first() {
            let pos = idx * bs as u64;
            if pos < *length {
                if let Some(block) = blocks.get(&idx) {
                    let n = (bs as u64).min(*length - pos) as usize;
                    file.seek(SeekFrom::Start(pos))?;
                    file.write_all(&block.bytes[..n])?;
                    written += 1;
                }
            }
            dirty.remove(&idx);
        }
        file.flush()?;
        if *physical_length != *length {
            file.set_len(*length)?;
            *physical_length = *length;
        }
        Ok(written)
    }

    /// 两代时钟：丢弃上一代以来未被引用的干净块，其余块清掉引用位。
    fn evict_unreferenced(&mut self) -> usize {
        let before = self.blocks.len();
        let dirty = &self.dirty;
        self.blocks.retain(|idx, b| {
            let keep = b.referenced || dirty.contains(idx);
            b.referenced = false;
            keep
        });
        before - self.blocks.len()
    }
}

/// `offset + len`，超出 u64 时报错。
fn end_offset(offset: u64, len: usize) -> Result<u64> {
    offset.checked_add(len as u64).ok_or_else(|| {
        Error::invalid("offset", format!("{offset} + {len} bytes overflows the file offset"))
    })
}

fn check_count(count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::invalid("count", "must be at least 1"));
    }
    Ok(())
}
