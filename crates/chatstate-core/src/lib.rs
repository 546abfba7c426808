//! ChatState Core - conversational-state cache and resource-pooling engine
//!
//! Sits between a request-handling front end and the durable store in
//! chatstate-storage. Provides low-latency cached reads of per-user state, a
//! bounded pool of store handles, a warm pool of provider client handles, a
//! streaming throttle for incremental output, and a background cleanup
//! scheduler.
//!
//! The durable store is the single source of truth; every cache here is a
//! disposable derived view. Losing the cache costs latency on the next read,
//! never data.

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod throttle;
pub mod warm;

pub use cache::{CacheManager, RegionConfig, RegionStats, build_key};
pub use cleanup::{CleanupConfig, CleanupScheduler};
pub use config::EngineConfig;
pub use error::{CoreError, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::{ConnectionPool, PoolConfig, PooledConn, StoreHandle};
pub use retry::{RetryConfig, RetryState};
pub use throttle::{DeliveryError, DeliverySink, StreamThrottle, ThrottleConfig};
pub use warm::{ProviderClient, ProviderFactory, ProviderStats, WarmConfig, WarmPool};

use chatstate_storage::{HistoryRow, Storage, UserSettings};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Cache region for per-user settings.
pub const SETTINGS_REGION: &str = "settings";
/// Cache region for recent message history.
pub const HISTORY_REGION: &str = "history";

/// Engine aggregate owning the cache, pools, throttle, and scheduler.
///
/// Components are explicitly constructed and passed by reference; there is no
/// ambient singleton. Construction order: metrics, connection pool, cache
/// regions, warm pool, streaming throttle, cleanup scheduler. [`Engine::shutdown`]
/// tears down in reverse, joining the scheduler so no run is left holding a
/// connection.
pub struct Engine {
    pub metrics: Arc<Metrics>,
    pub pool: Arc<ConnectionPool>,
    pub cache: Arc<CacheManager>,
    pub warm: Arc<WarmPool>,
    pub throttle: Arc<StreamThrottle>,
    cleanup: CleanupScheduler,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        storage: Arc<Storage>,
        factory: Arc<dyn ProviderFactory>,
        sink: Arc<dyn DeliverySink>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let metrics = Metrics::new();
        let pool = ConnectionPool::new(config.pool, storage, metrics.clone());
        let cache = Arc::new(CacheManager::new(config.regions, metrics.clone()));
        let warm = Arc::new(WarmPool::new(config.warm, factory, metrics.clone()));
        let throttle = Arc::new(StreamThrottle::new(config.throttle, sink, metrics.clone()));
        let cleanup = CleanupScheduler::new(
            config.cleanup,
            pool.clone(),
            cache.clone(),
            metrics.clone(),
        );

        Ok(Self {
            metrics,
            pool,
            cache,
            warm,
            throttle,
            cleanup,
        })
    }

    /// Pre-warm provider clients and start the cleanup scheduler.
    pub async fn start(&mut self) {
        self.warm.warm().await;
        self.cleanup.start();
        info!("engine started");
    }

    /// Stop background work and join it. Pooled connections all return
    /// through guard drops before this resolves.
    pub async fn shutdown(&mut self) {
        self.cleanup.stop().await;
        info!("engine shut down");
    }

    /// Cached read of a user's settings. Falls through to the store at most
    /// once per TTL window; concurrent misses share one load.
    pub async fn user_settings(&self, user_id: u64) -> Result<Option<UserSettings>> {
        let key = user_id.to_string();
        let pool = self.pool.clone();
        let bytes = self
            .cache
            .get_or_load(SETTINGS_REGION, &key, || async move {
                let conn = pool.acquire().await.map_err(anyhow::Error::new)?;
                let settings = conn.storage().settings.get(user_id)?;
                settings.map(|s| serde_json::to_vec(&s)).transpose().map_err(Into::into)
            })
            .await?;

        decode(bytes)
    }

    /// Write settings through to the store and invalidate the cached copy so
    /// the next read observes the new row.
    pub async fn save_user_settings(&self, user_id: u64, provider: &str, model: &str) -> Result<()> {
        let conn = self.pool.acquire().await?;
        conn.storage()
            .settings
            .put(user_id, &UserSettings::new(provider, model))
            .map_err(CoreError::from)?;
        drop(conn);

        self.cache.invalidate(SETTINGS_REGION, &user_id.to_string());
        Ok(())
    }

    /// Cached read of a user's most recent history rows, oldest first.
    pub async fn recent_history(&self, user_id: u64, limit: usize) -> Result<Vec<HistoryRow>> {
        let key = build_key(&[&user_id.to_string(), &limit.to_string()]);
        let pool = self.pool.clone();
        let bytes = self
            .cache
            .get_or_load(HISTORY_REGION, &key, || async move {
                let conn = pool.acquire().await.map_err(anyhow::Error::new)?;
                let rows = conn.storage().history.recent(user_id, limit)?;
                Ok(Some(serde_json::to_vec(&rows)?))
            })
            .await?;

        Ok(decode(bytes)?.unwrap_or_default())
    }

    /// Persist a message, refresh the user's activity, account usage, and
    /// invalidate the cached history window.
    pub async fn record_message(
        &self,
        user_id: u64,
        content: &str,
        from_bot: bool,
        tokens: u64,
    ) -> Result<()> {
        let conn = self.pool.acquire().await?;
        let now = Utc::now();
        conn.storage()
            .history
            .append(
                user_id,
                now,
                &HistoryRow {
                    content: content.to_string(),
                    from_bot,
                },
            )
            .map_err(CoreError::from)?;
        if !from_bot {
            conn.storage()
                .settings
                .touch(user_id)
                .map_err(CoreError::from)?;
        }
        let day = now.format("%Y-%m-%d").to_string();
        conn.storage()
            .usage
            .record(user_id, &day, 1, tokens)
            .map_err(CoreError::from)?;
        drop(conn);

        self.cache
            .invalidate_prefix(HISTORY_REGION, &format!("{user_id}:"));
        Ok(())
    }

    /// Reset a conversation session: destroy its stream buffer, drop its
    /// cached state, and delete its history rows. A flush racing the reset
    /// cannot resurrect content; the next read starts from a cache miss.
    pub async fn reset_session(&self, user_id: u64) -> Result<()> {
        let key = user_id.to_string();
        self.throttle.reset(&key);
        self.cache.invalidate_all(&key);
        self.cache.invalidate_prefix(HISTORY_REGION, &format!("{key}:"));

        let conn = self.pool.acquire().await?;
        conn.storage()
            .history
            .delete_users(&[user_id])
            .map_err(CoreError::from)?;
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: Option<Vec<u8>>) -> Result<Option<T>> {
    bytes
        .map(|b| serde_json::from_slice(&b))
        .transpose()
        .map_err(|e| CoreError::Storage(Arc::new(e.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    struct NullFactory;

    #[async_trait]
    impl ProviderFactory for NullFactory {
        async fn build(&self, name: &str) -> anyhow::Result<Arc<dyn ProviderClient>> {
            struct Client(String);
            impl ProviderClient for Client {
                fn provider_id(&self) -> &str {
                    &self.0
                }
            }
            Ok(Arc::new(Client(name.to_string())))
        }
    }

    struct NullSink;

    #[async_trait]
    impl DeliverySink for NullSink {
        async fn deliver(
            &self,
            _conversation: &str,
            _seq: u64,
            _content: &str,
        ) -> std::result::Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn engine() -> (tempfile::TempDir, Engine) {
        let temp_dir = tempdir().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path().join("test.db")).unwrap());
        let engine = Engine::new(
            EngineConfig::default(),
            storage,
            Arc::new(NullFactory),
            Arc::new(NullSink),
        )
        .unwrap();
        (temp_dir, engine)
    }

    #[tokio::test]
    async fn settings_read_through_hits_cache_on_second_read() {
        let (_dir, engine) = engine();

        engine.save_user_settings(1, "openai", "gpt-4").await.unwrap();

        let first = engine.user_settings(1).await.unwrap().unwrap();
        assert_eq!(first.provider, "openai");

        let hits_before = engine.metrics.cache_hits.load(Ordering::Relaxed);
        let second = engine.user_settings(1).await.unwrap().unwrap();
        assert_eq!(second.model, "gpt-4");
        assert!(engine.metrics.cache_hits.load(Ordering::Relaxed) > hits_before);
    }

    #[tokio::test]
    async fn unknown_user_is_none_not_an_error() {
        let (_dir, engine) = engine();
        assert!(engine.user_settings(404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saving_settings_invalidates_the_cached_row() {
        let (_dir, engine) = engine();

        engine.save_user_settings(1, "openai", "gpt-4").await.unwrap();
        engine.user_settings(1).await.unwrap();

        engine.save_user_settings(1, "anthropic", "claude").await.unwrap();
        let settings = engine.user_settings(1).await.unwrap().unwrap();
        assert_eq!(settings.provider, "anthropic");
    }

    #[tokio::test]
    async fn history_roundtrip_with_cache_invalidation() {
        let (_dir, engine) = engine();

        engine.record_message(1, "hi", false, 3).await.unwrap();
        assert_eq!(engine.recent_history(1, 10).await.unwrap().len(), 1);

        engine.record_message(1, "hello!", true, 5).await.unwrap();
        let rows = engine.recent_history(1, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].from_bot);
    }

    #[tokio::test]
    async fn reset_session_clears_cache_history_and_stream() {
        let (_dir, engine) = engine();

        engine.record_message(1, "hi", false, 1).await.unwrap();
        engine.recent_history(1, 10).await.unwrap();
        engine.throttle.append("1", "partial").await.unwrap();

        engine.reset_session(1).await.unwrap();

        assert_eq!(engine.throttle.active_streams(), 0);
        assert!(engine.recent_history(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let (_dir, mut engine) = engine();
        engine.start().await;
        engine.shutdown().await;
        assert_eq!(engine.pool.in_use(), 0);
    }
}
