//! Named cache regions with TTL, LRU eviction, and single-flight loads.
//!
//! Regions are created once at startup and live for the process lifetime.
//! The cache is a disposable view over the durable store: expiry is judged
//! lazily on every read, so an expired entry reports a miss even before any
//! physical sweep has removed it.

use crate::error::{CoreError, Result};
use crate::metrics::Metrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Per-region configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    /// Entry TTL.
    pub ttl: Duration,
    /// Maximum entries before LRU eviction.
    pub max_entries: usize,
}

impl RegionConfig {
    pub fn new(name: &str, ttl: Duration, max_entries: usize) -> Self {
        Self {
            name: name.to_string(),
            ttl,
            max_entries,
        }
    }
}

struct CacheEntry {
    value: Vec<u8>,
    inserted_at: Instant,
    expires_at: Instant,
    last_access: Instant,
}

struct Region {
    config: RegionConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    metrics: Arc<Metrics>,
}

impl Region {
    fn new(config: RegionConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            metrics,
        }
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now < entry.expires_at => {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                // Expired but not yet swept: logically absent, removed
                // opportunistically.
                entries.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, key: &str, value: Vec<u8>) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if !entries.contains_key(key) && entries.len() >= self.config.max_entries {
            self.evict_one(&mut entries);
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: now + self.config.ttl,
                last_access: now,
            },
        );
    }

    /// Least-recently-accessed entry goes first, ties broken by oldest
    /// insertion. Expiry is deliberately not consulted: expired entries are
    /// already invisible to readers, so sweep order cannot change what a
    /// caller observes.
    fn evict_one(&self, entries: &mut HashMap<String, CacheEntry>) {
        let victim = entries
            .iter()
            .min_by_key(|(_, entry)| (entry.last_access, entry.inserted_at))
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.metrics.cache_evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    fn remove_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        let pruned = before - entries.len();
        self.expirations.fetch_add(pruned as u64, Ordering::Relaxed);
        self.metrics
            .cache_expirations
            .fetch_add(pruned as u64, Ordering::Relaxed);
        pruned
    }
}

/// Per-region statistics for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct RegionStats {
    pub name: String,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

type LoadOutcome = Result<Option<Vec<u8>>>;

/// Cache manager over a fixed set of named regions.
pub struct CacheManager {
    regions: HashMap<String, Region>,
    inflight: DashMap<String, Arc<OnceCell<LoadOutcome>>>,
    metrics: Arc<Metrics>,
}

/// Colon-joined cache key, the storage layer's composite-key convention.
pub fn build_key(parts: &[&str]) -> String {
    parts.join(":")
}

impl CacheManager {
    pub fn new(regions: Vec<RegionConfig>, metrics: Arc<Metrics>) -> Self {
        let regions = regions
            .into_iter()
            .map(|config| (config.name.clone(), Region::new(config, metrics.clone())))
            .collect();
        Self {
            regions,
            inflight: DashMap::new(),
            metrics,
        }
    }

    /// Cached value if present and unexpired.
    pub fn get(&self, region: &str, key: &str) -> Option<Vec<u8>> {
        let Some(region) = self.region(region) else {
            return None;
        };
        let value = region.get(key);
        match value {
            Some(_) => self.metrics.record_cache_hit(),
            None => self.metrics.record_cache_miss(),
        }
        value
    }

    /// Unconditional write-through.
    pub fn put(&self, region: &str, key: &str, value: Vec<u8>) {
        if let Some(region) = self.region(region) {
            region.put(key, value);
        }
    }

    /// Resolve a miss through the loader, with at most one concurrent load
    /// per (region, key). Joined callers share the winner's value or error.
    ///
    /// The loader returns `Ok(None)` for "no such record"; that outcome is
    /// handed back as a miss and not cached, so a subsequent write shows up
    /// on the next read. Transport failures surface as
    /// [`CoreError::LoadFailed`] to every joined waiter identically.
    pub async fn get_or_load<F, Fut>(&self, region: &str, key: &str, loader: F) -> LoadOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Vec<u8>>>>,
    {
        if let Some(value) = self.get(region, key) {
            return Ok(Some(value));
        }

        let slot = build_key(&[region, key]);
        let cell = {
            let entry = self
                .inflight
                .entry(slot.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()));
            entry.clone()
        };

        let outcome = cell
            .get_or_init(|| async {
                self.metrics.loads_started.fetch_add(1, Ordering::Relaxed);
                match loader().await {
                    Ok(Some(value)) => {
                        self.put(region, key, value.clone());
                        Ok(Some(value))
                    }
                    Ok(None) => Ok(None),
                    Err(e) => {
                        self.metrics.load_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(region, key, error = %e, "cache loader failed");
                        Err(CoreError::LoadFailed(Arc::new(e)))
                    }
                }
            })
            .await
            .clone();

        // Retire only the cell this caller awaited. A blanket remove could
        // evict a newer generation's still-loading cell and let a third
        // caller start a duplicate load for the same slot.
        self.inflight.remove_if(&slot, |_, c| Arc::ptr_eq(c, &cell));
        outcome
    }

    /// Remove an entry immediately. Used when the durable store is written
    /// directly.
    pub fn invalidate(&self, region: &str, key: &str) -> bool {
        self.region(region).is_some_and(|r| r.remove(key))
    }

    /// Remove entries whose key starts with the prefix.
    pub fn invalidate_prefix(&self, region: &str, prefix: &str) -> usize {
        self.region(region)
            .map_or(0, |r| r.remove_prefix(prefix))
    }

    /// Remove this key from every region. Used on session reset.
    pub fn invalidate_all(&self, key: &str) {
        for region in self.regions.values() {
            region.remove(key);
        }
    }

    /// Drop every entry in a region.
    pub fn clear(&self, region: &str) {
        if let Some(region) = self.region(region) {
            region.entries.lock().clear();
        }
    }

    /// Physically remove expired entries across all regions. Returns entries
    /// pruned. Readers never observe the difference; this only reclaims
    /// memory.
    pub fn sweep_expired(&self) -> usize {
        self.regions.values().map(Region::prune_expired).sum()
    }

    pub fn stats(&self) -> Vec<RegionStats> {
        let mut stats: Vec<RegionStats> = self
            .regions
            .values()
            .map(|region| RegionStats {
                name: region.config.name.clone(),
                entries: region.entries.lock().len(),
                hits: region.hits.load(Ordering::Relaxed),
                misses: region.misses.load(Ordering::Relaxed),
                evictions: region.evictions.load(Ordering::Relaxed),
                expirations: region.expirations.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn region(&self, name: &str) -> Option<&Region> {
        let region = self.regions.get(name);
        if region.is_none() {
            warn!(region = name, "unknown cache region");
        }
        region
    }
}
