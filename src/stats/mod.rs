use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// 进程级计数器（块存储 / 并行排序共用）
pub(crate) struct Counters {
    pub block_stores_opened: AtomicU64,
    pub block_stores_disposed: AtomicU64,
    pub flushes: AtomicU64,
    pub blocks_written: AtomicU64,
    pub blocks_evicted: AtomicU64,
    pub collections: AtomicU64,
    pub sorts: AtomicU64,
    pub partitions_offloaded: AtomicU64,
    pub partitions_inline: AtomicU64,
}

pub(crate) static COUNTERS: Counters = Counters {
    block_stores_opened: AtomicU64::new(0),
    block_stores_disposed: AtomicU64::new(0),
    flushes: AtomicU64::new(0),
    blocks_written: AtomicU64::new(0),
    blocks_evicted: AtomicU64::new(0),
    collections: AtomicU64::new(0),
    sorts: AtomicU64::new(0),
    partitions_offloaded: AtomicU64::new(0),
    partitions_inline: AtomicU64::new(0),
};

impl Counters {
    pub fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// 内存占用与引擎计数快照
#[derive(Clone, Debug, Default, Serialize)]
pub struct MemoryReport {
    /// 进程级 RSS（从 /proc/self/statm 读取，失败时回退 sysinfo）
    pub process_rss_bytes: u64,
    pub storage: StorageStats,
    pub sort: SortStats,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StorageStats {
    /// 当前仍打开的块存储数
    pub live_block_stores: u64,
    pub flushes: u64,
    /// 累计写回磁盘的块数
    pub blocks_written: u64,
    /// 累计被回收的干净块数
    pub blocks_evicted: u64,
    /// 压力触发的回收次数
    pub collections: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SortStats {
    pub sorts: u64,
    /// 交给 worker 的分区数
    pub partitions_offloaded: u64,
    /// 在调用方线程上处理的分区数
    pub partitions_inline: u64,
}

impl MemoryReport {
    pub fn collect() -> Self {
        let c = &COUNTERS;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        Self {
            process_rss_bytes: Self::read_process_rss(),
            storage: StorageStats {
                live_block_stores: load(&c.block_stores_opened)
                    .saturating_sub(load(&c.block_stores_disposed)),
                flushes: load(&c.flushes),
                blocks_written: load(&c.blocks_written),
                blocks_evicted: load(&c.blocks_evicted),
                collections: load(&c.collections),
            },
            sort: SortStats {
                sorts: load(&c.sorts),
                partitions_offloaded: load(&c.partitions_offloaded),
                partitions_inline: load(&c.partitions_inline),
            },
        }
    }

    /// 进程常驻内存（字节）。Linux 走 statm 第二列，其余平台交给 sysinfo。
    pub fn read_process_rss() -> u64 {
        statm_resident_pages()
            .map(|pages| pages * page_size())
            .or_else(sysinfo_process_memory)
            .unwrap_or(0)
    }
}

fn statm_resident_pages() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    statm.split_ascii_whitespace().nth(1)?.parse().ok()
}

fn page_size() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
}

fn sysinfo_process_memory() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = sysinfo::System::new();
    sys.refresh_process(pid);
    sys.process(pid).map(|p| p.memory())
}

/// 回收之后把空闲页还给 OS。
#[cfg(feature = "mimalloc")]
pub(crate) fn maybe_trim_rss() {
    // 全局分配器是 mimalloc 时 malloc_trim 不起作用
    extern "C" {
        fn mi_collect(force: bool);
    }
    unsafe { mi_collect(true) };
}

#[cfg(all(not(feature = "mimalloc"), target_os = "linux", target_env = "gnu"))]
pub(crate) fn maybe_trim_rss() {
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(all(
    not(feature = "mimalloc"),
    not(all(target_os = "linux", target_env = "gnu"))
))]
pub(crate) fn maybe_trim_rss() {}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut unit = 0;
    let mut scaled = bytes as f64;
    while scaled >= 1024.0 && unit + 1 < UNITS.len() {
        scaled /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{scaled:.2} {}", UNITS[unit])
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           bigindex Memory Report                 ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Block stores:                                    ║")?;
        let s = &self.storage;
        for (label, v) in [
            ("live", s.live_block_stores),
            ("flushes", s.flushes),
            ("written", s.blocks_written),
            ("evicted", s.blocks_evicted),
            ("collections", s.collections),
        ] {
            writeln!(f, "║   {:<13}{:>10}                       ║", label, v)?;
        }
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Parallel sort:                                   ║")?;
        let t = &self.sort;
        for (label, v) in [
            ("sorts", t.sorts),
            ("offloaded", t.partitions_offloaded),
            ("inline", t.partitions_inline),
        ] {
            writeln!(f, "║   {:<13}{:>10}                       ║", label, v)?;
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_picks_unit() {
        assert_eq!(human_bytes(12), "12 B");
        assert_eq!(human_bytes(2048), "2.00 KB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn report_reads_rss_and_renders() {
        let r = MemoryReport::collect();
        #[cfg(target_os = "linux")]
        assert!(r.process_rss_bytes > 0);
        let text = r.to_string();
        assert!(text.contains("Block stores"));
        assert!(text.contains("Parallel sort"));
    }
}
