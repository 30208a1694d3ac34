//! Metric sampler.
//!
//! One loop ticks every `poll_interval` seconds; each tick launches the
//! three sample groups (runtime allocator stats, host stats, the poll
//! counter) concurrently. Each group writes through a single `update`
//! transaction on its register.

use rand::Rng;
use std::sync::Arc;
use sysinfo::{CpuExt, CpuRefreshKind, PidExt, ProcessExt, RefreshKind, System, SystemExt};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};
use vitals_core::error::{Result, VitalsError};
use vitals_core::store::MemoryStore;

pub mod alloc_stats {
    //! Process allocator statistics via a counting global allocator.
    //!
    //! The binary installs [`CountingAllocator`] with `#[global_allocator]`;
    //! every allocation and free updates the atomics read by
    //! [`snapshot`].

    use std::alloc::{GlobalAlloc, Layout, System};
    use std::sync::atomic::{AtomicU64, Ordering};

    static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
    static TOTAL_BYTES: AtomicU64 = AtomicU64::new(0);
    static MALLOCS: AtomicU64 = AtomicU64::new(0);
    static FREES: AtomicU64 = AtomicU64::new(0);

    pub struct CountingAllocator;

    unsafe impl GlobalAlloc for CountingAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let ptr = System.alloc(layout);
            if !ptr.is_null() {
                LIVE_BYTES.fetch_add(layout.size() as u64, Ordering::Relaxed);
                TOTAL_BYTES.fetch_add(layout.size() as u64, Ordering::Relaxed);
                MALLOCS.fetch_add(1, Ordering::Relaxed);
            }
            ptr
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            System.dealloc(ptr, layout);
            LIVE_BYTES.fetch_sub(layout.size() as u64, Ordering::Relaxed);
            FREES.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct AllocSnapshot {
        /// Live heap bytes.
        pub alloc: u64,
        /// Cumulative allocated bytes.
        pub total_alloc: u64,
        /// Cumulative allocation count.
        pub mallocs: u64,
        /// Cumulative free count.
        pub frees: u64,
    }

    pub fn snapshot() -> AllocSnapshot {
        AllocSnapshot {
            alloc: LIVE_BYTES.load(Ordering::Relaxed),
            total_alloc: TOTAL_BYTES.load(Ordering::Relaxed),
            mallocs: MALLOCS.load(Ordering::Relaxed),
            frees: FREES.load(Ordering::Relaxed),
        }
    }
}

pub struct Collector {
    store: Arc<MemoryStore>,
    poll_interval: u64,
    system: Mutex<System>,
    pid: Option<sysinfo::Pid>,
    cpu_cores: usize,
}

impl Collector {
    pub fn new(store: Arc<MemoryStore>, poll_interval: u64) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new().with_memory().with_cpu(CpuRefreshKind::everything()),
        );
        let cpu_cores = system.cpus().len();
        let pid = sysinfo::get_current_pid().ok();
        info!(cpu_cores, pid = pid.map(|p| p.as_u32()), "collector ready");

        Self { store, poll_interval, system: Mutex::new(system), pid, cpu_cores }
    }

    /// Allocator statistics, process RSS and the random probe gauge.
    pub async fn sample_runtime(&self) {
        let snap = alloc_stats::snapshot();

        let rss = match self.pid {
            Some(pid) => {
                let mut system = self.system.lock().await;
                system.refresh_process(pid);
                system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => 0,
        };

        let random_value = rand::thread_rng().gen_range(1.0..101.0);

        self.store
            .gauge
            .update(|tx| {
                tx.set("Alloc", snap.alloc as f64);
                tx.set("TotalAlloc", snap.total_alloc as f64);
                tx.set("Mallocs", snap.mallocs as f64);
                tx.set("Frees", snap.frees as f64);
                tx.set("Sys", rss as f64);
                tx.set("RandomValue", random_value);
            })
            .await;
        debug!("runtime sample collected");
    }

    /// Host memory and per-core CPU utilization.
    pub async fn sample_host(&self) {
        let (total, free, cores) = {
            let mut system = self.system.lock().await;
            system.refresh_memory();
            system.refresh_cpu();
            let cores: Vec<f64> =
                system.cpus().iter().map(|cpu| f64::from(cpu.cpu_usage())).collect();
            (system.total_memory() as f64, system.free_memory() as f64, cores)
        };

        self.store
            .gauge
            .update(|tx| {
                tx.set("TotalMemory", total);
                tx.set("FreeMemory", free);
                for (i, usage) in cores.iter().take(self.cpu_cores).enumerate() {
                    tx.set(&format!("CPUutilization{}", i + 1), *usage);
                }
            })
            .await;
        debug!("host sample collected");
    }

    /// The poll counter, accumulated once per tick.
    pub async fn sample_counters(&self) {
        self.store.counter.update(|tx| tx.set_accum("PollCount", 1)).await;
    }

    /// Tick until shutdown. Returns the graceful-shutdown sentinel.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = interval(Duration::from_secs(self.poll_interval.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::join!(
                        self.sample_runtime(),
                        self.sample_host(),
                        self.sample_counters(),
                    );
                    metrics::counter!("vitals_agent_polls_total").increment(1);
                }
                _ = shutdown.recv() => {
                    info!("collector stopped");
                    return Err(VitalsError::GracefulShutdown);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> Collector {
        Collector::new(Arc::new(MemoryStore::new()), 2)
    }

    #[tokio::test]
    async fn runtime_sample_fills_allocator_gauges() {
        let c = collector();
        c.sample_runtime().await;

        let gauges = c.store.gauge_all().await;
        for name in ["Alloc", "TotalAlloc", "Mallocs", "Frees", "Sys", "RandomValue"] {
            assert!(gauges.contains_key(name), "missing {name}");
        }
    }

    #[tokio::test]
    async fn random_value_stays_in_range() {
        let c = collector();
        for _ in 0..32 {
            c.sample_runtime().await;
            let v = c.store.gauge("RandomValue").await.unwrap();
            assert!((1.0..101.0).contains(&v), "{v}");
        }
    }

    #[tokio::test]
    async fn host_sample_fills_memory_gauges() {
        let c = collector();
        c.sample_host().await;

        let gauges = c.store.gauge_all().await;
        assert!(gauges.contains_key("TotalMemory"));
        assert!(gauges.contains_key("FreeMemory"));
        for i in 1..=c.cpu_cores {
            assert!(gauges.contains_key(&format!("CPUutilization{i}")), "core {i}");
        }
    }

    #[tokio::test]
    async fn poll_count_accumulates_per_tick() {
        let c = collector();
        c.sample_counters().await;
        c.sample_counters().await;
        c.sample_counters().await;
        assert_eq!(c.store.counter("PollCount").await, Some(3));
    }

    #[tokio::test]
    async fn loop_returns_sentinel_on_shutdown() {
        let c = Arc::new(collector());
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let sampling = {
            let c = c.clone();
            tokio::spawn(async move { c.run(shutdown_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), sampling)
            .await
            .expect("collector did not stop")
            .unwrap();
        assert!(matches!(outcome, Err(VitalsError::GracefulShutdown)));
    }
}
