use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::config;
use crate::stats::MemoryReport;

/// 内存压力回调。
///
/// 可能与监听者自身的其它操作并发调用；实现方不能在这里无界阻塞。
pub trait PressureListener: Send + Sync {
    fn on_memory_pressure(&self, process_bytes: u64);
}

/// 内存压力监视器：登记弱引用监听者，采样进程常驻内存并逐个通知。
///
/// - 采样线程在首次登记时才启动（周期取自配置）
/// - 宿主也可以直接 `notify`（OS 钩子 / 测试）
/// - 已释放的监听者在下一次通知时被剔除
pub struct PressureMonitor {
    listeners: Mutex<Vec<Weak<dyn PressureListener>>>,
    interval: Duration,
    sampler_started: AtomicBool,
    samples: AtomicU64,
}

impl PressureMonitor {
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(Vec::new()),
            interval,
            sampler_started: AtomicBool::new(false),
            samples: AtomicU64::new(0),
        })
    }

    pub fn global() -> &'static Arc<PressureMonitor> {
        static GLOBAL: OnceLock<Arc<PressureMonitor>> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(config::global().pressure_poll_interval()))
    }

    pub fn register(self: &Arc<Self>, listener: Weak<dyn PressureListener>) {
        self.listeners.lock().push(listener);
        self.ensure_sampler();
    }

    /// 当前仍存活的监听者数量
    pub fn listener_count(&self) -> usize {
        let mut g = self.listeners.lock();
        g.retain(|w| w.strong_count() > 0);
        g.len()
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// 以给定的进程内存读数通知全部存活监听者。
    pub fn notify(&self, process_bytes: u64) {
        // 先在锁内收集强引用，锁外回调：回调可能很慢（抢存储锁 + flush）。
        let live: Vec<Arc<dyn PressureListener>> = {
            let mut g = self.listeners.lock();
            g.retain(|w| w.strong_count() > 0);
            g.iter().filter_map(Weak::upgrade).collect()
        };
        for l in live {
            l.on_memory_pressure(process_bytes);
        }
    }

    fn ensure_sampler(self: &Arc<Self>) {
        if self.sampler_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak = Arc::downgrade(self);
        let ticker = crossbeam::channel::tick(self.interval);
        let spawned = std::thread::Builder::new()
            .name("bigindex-pressure".into())
            .spawn(move || {
                for _ in ticker.iter() {
                    let Some(monitor) = weak.upgrade() else {
                        break;
                    };
                    let bytes = MemoryReport::read_process_rss();
                    monitor.samples.fetch_add(1, Ordering::Relaxed);
                    monitor.notify(bytes);
                }
                tracing::debug!("Pressure sampler exiting (monitor dropped)");
            });

        if let Err(e) = spawned {
            tracing::warn!("Failed to start pressure sampler, relying on explicit notify: {}", e);
            self.sampler_started.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        calls: AtomicUsize,
        last: AtomicU64,
    }

    impl PressureListener for Counting {
        fn on_memory_pressure(&self, process_bytes: u64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last.store(process_bytes, Ordering::SeqCst);
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            last: AtomicU64::new(0),
        })
    }

    #[test]
    fn notify_reaches_live_listeners_and_prunes_dead() {
        let monitor = PressureMonitor::new(Duration::from_secs(3600));
        let a = counting();
        let b = counting();
        let a_dyn: Arc<dyn PressureListener> = a.clone();
        let b_dyn: Arc<dyn PressureListener> = b.clone();
        monitor.register(Arc::downgrade(&a_dyn));
        monitor.register(Arc::downgrade(&b_dyn));
        assert_eq!(monitor.listener_count(), 2);

        monitor.notify(42);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.last.load(Ordering::SeqCst), 42);

        drop(b_dyn);
        drop(b);
        monitor.notify(7);
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.listener_count(), 1);
    }

    #[test]
    fn sampler_feeds_listeners() {
        let monitor = PressureMonitor::new(Duration::from_millis(10));
        let a = counting();
        let a_dyn: Arc<dyn PressureListener> = a.clone();
        monitor.register(Arc::downgrade(&a_dyn));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while a.calls.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(a.calls.load(Ordering::SeqCst) > 0);
        assert!(monitor.samples_taken() > 0);
    }
}
