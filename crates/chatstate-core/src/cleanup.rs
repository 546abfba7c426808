//! Background cleanup scheduler.
//!
//! Runs on a fixed interval independent of request traffic. Each run acquires
//! its own pooled connection, prunes conversations inactive beyond the
//! configured threshold, and invalidates the matching cache entries. The
//! connection is released before the task sleeps again. A run that fails
//! midway is retried wholesale on the next tick; the inactivity predicate is
//! idempotent, so partial deletions are picked up then.

use crate::cache::CacheManager;
use crate::error::{CoreError, Result};
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Cleanup configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Interval between runs.
    pub interval: Duration,
    /// Inactivity threshold beyond which a conversation is pruned.
    pub inactive_after: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            inactive_after: Duration::from_secs(86_400),
        }
    }
}

/// Periodic pruner of inactive conversation state.
pub struct CleanupScheduler {
    config: CleanupConfig,
    pool: Arc<ConnectionPool>,
    cache: Arc<CacheManager>,
    metrics: Arc<Metrics>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupScheduler {
    pub fn new(
        config: CleanupConfig,
        pool: Arc<ConnectionPool>,
        cache: Arc<CacheManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            pool,
            cache,
            metrics,
            shutdown_tx,
            handle: None,
        }
    }

    /// Spawn the scheduler task.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        info!(interval_secs = self.config.interval.as_secs(), "starting cleanup scheduler");

        let config = self.config.clone();
        let pool = self.pool.clone();
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so runs start one
            // interval after startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("cleanup scheduler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = Self::run_once(&config, &pool, &cache, &metrics).await {
                            error!(error = %e, "cleanup run failed, retrying next tick");
                        }
                    }
                }
            }
        }));
    }

    /// Stop the scheduler and join its task so no run is left holding a
    /// pooled connection.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub(crate) async fn run_once(
        config: &CleanupConfig,
        pool: &Arc<ConnectionPool>,
        cache: &Arc<CacheManager>,
        metrics: &Arc<Metrics>,
    ) -> Result<()> {
        let conn = pool.acquire().await?;

        let inactive_after = chrono::Duration::from_std(config.inactive_after)
            .map_err(|e| CoreError::from(anyhow::Error::new(e)))?;
        let cutoff = Utc::now() - inactive_after;

        let inactive = conn
            .storage()
            .settings
            .inactive_since(cutoff)
            .map_err(CoreError::from)?;

        metrics.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        if inactive.is_empty() {
            return Ok(());
        }

        // Invalidate before deleting so no reader re-caches doomed rows
        // between the two steps.
        for &user in &inactive {
            let key = user.to_string();
            cache.invalidate_all(&key);
            cache.invalidate_prefix(crate::HISTORY_REGION, &format!("{key}:"));
        }

        let pruned = conn
            .storage()
            .history
            .delete_users(&inactive)
            .map_err(CoreError::from)?;

        metrics
            .cleanup_rows_pruned
            .fetch_add(pruned as u64, Ordering::Relaxed);
        info!(users = inactive.len(), pruned, "pruned inactive conversations");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RegionConfig;
    use crate::pool::PoolConfig;
    use chatstate_storage::{HistoryRow, Storage, UserSettings};
    use tempfile::tempdir;

    fn fixture() -> (
        tempfile::TempDir,
        Arc<Storage>,
        Arc<ConnectionPool>,
        Arc<CacheManager>,
        Arc<Metrics>,
    ) {
        let temp_dir = tempdir().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path().join("test.db")).unwrap());
        let metrics = Metrics::new();
        let pool = ConnectionPool::new(PoolConfig::default(), storage.clone(), metrics.clone());
        let cache = Arc::new(CacheManager::new(
            vec![
                RegionConfig::new("settings", Duration::from_secs(60), 64),
                RegionConfig::new("history", Duration::from_secs(60), 64),
            ],
            metrics.clone(),
        ));
        (temp_dir, storage, pool, cache, metrics)
    }

    fn message(content: &str) -> HistoryRow {
        HistoryRow {
            content: content.to_string(),
            from_bot: false,
        }
    }

    #[tokio::test]
    async fn prunes_inactive_users_and_keeps_active_ones() {
        let (_dir, storage, pool, cache, metrics) = fixture();

        storage.settings.put(1, &UserSettings::new("openai", "gpt-4")).unwrap();
        storage.history.append(1, Utc::now(), &message("stale")).unwrap();
        cache.put("settings", "1", b"cached".to_vec());
        cache.put("history", "1:20", b"cached".to_vec());

        // User 1 goes inactive, then user 2 shows up fresh.
        tokio::time::sleep(Duration::from_millis(80)).await;
        storage.settings.put(2, &UserSettings::new("openai", "gpt-4")).unwrap();
        storage.history.append(2, Utc::now(), &message("fresh")).unwrap();

        let config = CleanupConfig {
            interval: Duration::from_secs(3600),
            inactive_after: Duration::from_millis(50),
        };
        CleanupScheduler::run_once(&config, &pool, &cache, &metrics)
            .await
            .unwrap();

        assert_eq!(storage.history.count(1).unwrap(), 0);
        assert_eq!(storage.history.count(2).unwrap(), 1);
        assert!(cache.get("settings", "1").is_none());
        assert!(cache.get("history", "1:20").is_none());
        assert_eq!(metrics.cleanup_rows_pruned.load(Ordering::Relaxed), 1);

        // The run's connection went back to the pool.
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn empty_run_still_counts() {
        let (_dir, _storage, pool, cache, metrics) = fixture();

        let config = CleanupConfig::default();
        CleanupScheduler::run_once(&config, &pool, &cache, &metrics)
            .await
            .unwrap();

        assert_eq!(metrics.cleanup_runs.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.cleanup_rows_pruned.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn scheduler_starts_and_stops_cleanly() {
        let (_dir, _storage, pool, cache, metrics) = fixture();

        let mut scheduler = CleanupScheduler::new(
            CleanupConfig {
                interval: Duration::from_millis(10),
                inactive_after: Duration::from_secs(60),
            },
            pool,
            cache,
            metrics.clone(),
        );

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(35)).await;
        scheduler.stop().await;

        assert!(metrics.cleanup_runs.load(Ordering::Relaxed) >= 1);
    }
}
