use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Engine metrics collector.
///
/// Counters are plain atomics readable by an external collector via
/// [`Metrics::snapshot`]; this crate does not prescribe a collector protocol.
#[derive(Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_evictions: AtomicU64,
    pub cache_expirations: AtomicU64,
    pub loads_started: AtomicU64,
    pub load_failures: AtomicU64,
    pub pool_acquires: AtomicU64,
    pub pool_timeouts: AtomicU64,
    pub pool_health_failures: AtomicU64,
    pub pool_double_releases: AtomicU64,
    pub pool_in_use: AtomicUsize,
    pub providers_built: AtomicU64,
    pub provider_build_time_us: AtomicU64,
    pub flush_successes: AtomicU64,
    pub flush_retries: AtomicU64,
    pub flush_failures: AtomicU64,
    pub cleanup_runs: AtomicU64,
    pub cleanup_rows_pruned: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provider_build(&self, duration: std::time::Duration) {
        self.providers_built.fetch_add(1, Ordering::Relaxed);
        self.provider_build_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            cache_expirations: self.cache_expirations.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            pool_acquires: self.pool_acquires.load(Ordering::Relaxed),
            pool_timeouts: self.pool_timeouts.load(Ordering::Relaxed),
            pool_health_failures: self.pool_health_failures.load(Ordering::Relaxed),
            pool_double_releases: self.pool_double_releases.load(Ordering::Relaxed),
            pool_in_use: self.pool_in_use.load(Ordering::Relaxed),
            providers_built: self.providers_built.load(Ordering::Relaxed),
            provider_avg_build_us: self.avg_build_time(),
            flush_successes: self.flush_successes.load(Ordering::Relaxed),
            flush_retries: self.flush_retries.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            cleanup_rows_pruned: self.cleanup_rows_pruned.load(Ordering::Relaxed),
        }
    }

    fn avg_build_time(&self) -> u64 {
        let count = self.providers_built.load(Ordering::Relaxed);
        let time = self.provider_build_time_us.load(Ordering::Relaxed);
        if count > 0 { time / count } else { 0 }
    }

    fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let misses = self.cache_misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total > 0.0 { hits / total } else { 0.0 }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub cache_evictions: u64,
    pub cache_expirations: u64,
    pub load_failures: u64,
    pub pool_acquires: u64,
    pub pool_timeouts: u64,
    pub pool_health_failures: u64,
    pub pool_double_releases: u64,
    pub pool_in_use: usize,
    pub providers_built: u64,
    pub provider_avg_build_us: u64,
    pub flush_successes: u64,
    pub flush_retries: u64,
    pub flush_failures: u64,
    pub cleanup_runs: u64,
    pub cleanup_rows_pruned: u64,
}
