//! Warm pool of expensive-to-construct provider client handles.
//!
//! Handles are built once and reused across requests. The pool is the sole
//! owner; callers borrow shared references and never take ownership. Handles
//! are not evicted during normal operation, only replaced after a caller
//! reports one unusable.

use crate::error::{CoreError, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Opaque, capability-bearing client handle.
pub trait ProviderClient: Send + Sync + 'static {
    fn provider_id(&self) -> &str;
}

/// Constructs client handles by name. Must be safe to invoke concurrently
/// for distinct names; the pool guarantees at most one concurrent
/// construction per name.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn build(&self, name: &str) -> anyhow::Result<Arc<dyn ProviderClient>>;
}

/// Warm pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmConfig {
    /// Per-name construction timeout.
    pub construct_timeout: Duration,
    /// Provider names constructed at startup.
    pub providers: Vec<String>,
}

impl Default for WarmConfig {
    fn default() -> Self {
        Self {
            construct_timeout: Duration::from_secs(10),
            providers: Vec::new(),
        }
    }
}

struct WarmEntry {
    client: Arc<dyn ProviderClient>,
    created_at: Instant,
    build_latency: Duration,
    uses: AtomicU64,
}

/// Per-provider usage counters for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub uses: u64,
    pub build_ms: u64,
    pub age_secs: u64,
}

type BuildOutcome = Result<Arc<WarmEntry>>;

/// Warm pool of provider handles.
pub struct WarmPool {
    config: WarmConfig,
    factory: Arc<dyn ProviderFactory>,
    entries: DashMap<String, Arc<WarmEntry>>,
    building: DashMap<String, Arc<OnceCell<BuildOutcome>>>,
    metrics: Arc<Metrics>,
}

impl WarmPool {
    pub fn new(config: WarmConfig, factory: Arc<dyn ProviderFactory>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            factory,
            entries: DashMap::new(),
            building: DashMap::new(),
            metrics,
        }
    }

    /// Construct the configured providers in parallel. A name that fails to
    /// warm is logged and constructed lazily on its first real use.
    pub async fn warm(&self) {
        let names = self.config.providers.clone();
        if names.is_empty() {
            return;
        }

        let tasks = names.iter().map(|name| self.warm_one(name.as_str()));
        futures::future::join_all(tasks).await;
        info!(
            requested = names.len(),
            ready = self.entries.len(),
            "provider warm-up complete"
        );
    }

    async fn warm_one(&self, name: &str) {
        match self.build(name).await {
            Ok(_) => info!(provider = name, "provider warmed"),
            Err(e) => {
                warn!(provider = name, error = %e, "warm-up failed, will construct lazily on first use");
            }
        }
    }

    /// Borrow the handle for a provider, constructing and caching it on
    /// first access.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn ProviderClient>> {
        if let Some(entry) = self.entries.get(name) {
            entry.uses.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.client.clone());
        }

        let entry = self.build(name).await?;
        entry.uses.fetch_add(1, Ordering::Relaxed);
        Ok(entry.client.clone())
    }

    /// Discard a handle the caller observed to be unusable. The next `get`
    /// constructs a replacement lazily.
    pub fn report_unusable(&self, name: &str) -> bool {
        let removed = self.entries.remove(name).is_some();
        if removed {
            warn!(provider = name, "provider handle reported unusable, discarded");
        }
        removed
    }

    pub fn stats(&self) -> Vec<ProviderStats> {
        let mut stats: Vec<ProviderStats> = self
            .entries
            .iter()
            .map(|entry| ProviderStats {
                name: entry.key().clone(),
                uses: entry.uses.load(Ordering::Relaxed),
                build_ms: entry.build_latency.as_millis() as u64,
                age_secs: entry.created_at.elapsed().as_secs(),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    async fn build(&self, name: &str) -> BuildOutcome {
        let cell = {
            let entry = self
                .building
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()));
            entry.clone()
        };

        let outcome = cell
            .get_or_init(|| async {
                let start = Instant::now();
                let built =
                    tokio::time::timeout(self.config.construct_timeout, self.factory.build(name))
                        .await;
                let client = match built {
                    Ok(Ok(client)) => client,
                    Ok(Err(e)) => {
                        return Err(CoreError::ProviderUnavailable {
                            name: name.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    Err(_) => {
                        return Err(CoreError::ProviderUnavailable {
                            name: name.to_string(),
                            reason: "construction timed out".to_string(),
                        });
                    }
                };

                let build_latency = start.elapsed();
                self.metrics.record_provider_build(build_latency);
                let entry = Arc::new(WarmEntry {
                    client,
                    created_at: Instant::now(),
                    build_latency,
                    uses: AtomicU64::new(0),
                });
                self.entries.insert(name.to_string(), entry.clone());
                Ok(entry)
            })
            .await
            .clone();

        // Retire only the cell this caller awaited; a blanket remove could
        // drop a newer in-flight construction and let a duplicate start.
        self.building.remove_if(name, |_, c| Arc::ptr_eq(c, &cell));
        outcome
    }
}
