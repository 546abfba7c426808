//! Bounded pool of durable-store handles.
//!
//! Handles are checked out through [`ConnectionPool::acquire`] and returned
//! by dropping the [`PooledConn`] guard, so release happens on every exit
//! path including error propagation. On return each handle is health-checked;
//! a failed probe discards the handle and the pool replenishes lazily up to
//! its minimum size.

use crate::error::{CoreError, Result};
use crate::metrics::Metrics;
use chatstate_storage::Storage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

/// Pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections maintained eagerly.
    pub min_size: usize,
    /// Hard cap on live connections.
    pub max_size: usize,
    /// Callers allowed to queue once the pool is saturated.
    pub max_waiters: usize,
    /// Bounded wait for a checkout.
    pub acquire_timeout: Duration,
    /// Idle age beyond which a handle is re-probed before handout.
    pub max_idle_age: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 8,
            max_waiters: 32,
            acquire_timeout: Duration::from_secs(5),
            max_idle_age: Duration::from_secs(300),
        }
    }
}

/// A handle to the durable store owned by the pool.
pub struct StoreHandle {
    id: u64,
    storage: Arc<Storage>,
    broken: AtomicBool,
    last_health_check: Instant,
}

impl StoreHandle {
    fn new(id: u64, storage: Arc<Storage>) -> Self {
        Self {
            id,
            storage,
            broken: AtomicBool::new(false),
            last_health_check: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn last_health_check(&self) -> Instant {
        self.last_health_check
    }

    /// Flag the handle as unusable after a caller-observed storage fault.
    /// The pool will discard it on return instead of reusing it.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }

    fn ping(&self) -> anyhow::Result<()> {
        if self.broken.load(Ordering::Relaxed) {
            anyhow::bail!("connection {} marked broken", self.id);
        }
        self.storage.ping()
    }
}

struct IdleConn {
    handle: StoreHandle,
    idle_since: Instant,
}

struct PoolInner {
    idle: VecDeque<IdleConn>,
    leased: HashSet<u64>,
    created: usize,
}

/// Bounded connection pool over the durable store.
pub struct ConnectionPool {
    storage: Arc<Storage>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    inner: Mutex<PoolInner>,
    waiters: AtomicUsize,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, storage: Arc<Storage>, metrics: Arc<Metrics>) -> Arc<Self> {
        let pool = Arc::new(Self {
            storage,
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            inner: Mutex::new(PoolInner {
                idle: VecDeque::with_capacity(config.max_size),
                leased: HashSet::new(),
                created: 0,
            }),
            waiters: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            metrics,
            config,
        });

        pool.ensure_min();
        pool
    }

    /// Check out a connection within the configured wait bound.
    ///
    /// Fails with [`CoreError::PoolExhausted`] when the wait queue is already
    /// at its configured depth or the timeout elapses.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConn> {
        if self.semaphore.available_permits() == 0
            && self.waiters.load(Ordering::Relaxed) >= self.config.max_waiters
        {
            warn!("pool wait queue full, rejecting acquire");
            return Err(CoreError::PoolExhausted);
        }

        self.waiters.fetch_add(1, Ordering::Relaxed);
        let acquired = tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await;
        self.waiters.fetch_sub(1, Ordering::Relaxed);

        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(CoreError::PoolExhausted),
            Err(_) => {
                self.metrics.pool_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::PoolExhausted);
            }
        };

        let handle = self.checkout();
        self.metrics.pool_acquires.fetch_add(1, Ordering::Relaxed);
        self.metrics.pool_in_use.fetch_add(1, Ordering::Relaxed);

        Ok(PooledConn {
            pool: self.clone(),
            handle: Some(handle),
            _permit: permit,
        })
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.lock().leased.len()
    }

    /// Connections currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.lock().idle.len()
    }

    fn checkout(&self) -> StoreHandle {
        let mut inner = self.inner.lock();

        // Oldest-idle handles go out first so no store handle sits unused
        // past its freshness bound.
        while let Some(conn) = inner.idle.pop_front() {
            if conn.idle_since.elapsed() > self.config.max_idle_age
                && conn.handle.ping().is_err()
            {
                debug!(conn = conn.handle.id, "discarding stale idle connection");
                self.metrics
                    .pool_health_failures
                    .fetch_add(1, Ordering::Relaxed);
                inner.created -= 1;
                continue;
            }
            inner.leased.insert(conn.handle.id);
            return conn.handle;
        }

        // Saturation is bounded by the semaphore, so a fresh handle here can
        // never push `created` past max_size.
        let handle = self.create_handle();
        inner.created += 1;
        inner.leased.insert(handle.id);
        handle
    }

    fn checkin(&self, mut handle: StoreHandle) -> Result<()> {
        let released = self.inner.lock().leased.remove(&handle.id);
        if !released {
            self.metrics
                .pool_double_releases
                .fetch_add(1, Ordering::Relaxed);
            error!(conn = handle.id, "connection released twice");
            return Err(CoreError::DoubleRelease(handle.id));
        }
        self.metrics.pool_in_use.fetch_sub(1, Ordering::Relaxed);

        match handle.ping() {
            Ok(()) => {
                handle.last_health_check = Instant::now();
                self.inner.lock().idle.push_back(IdleConn {
                    handle,
                    idle_since: Instant::now(),
                });
            }
            Err(e) => {
                warn!(conn = handle.id, error = %e, "connection failed health check, discarding");
                self.metrics
                    .pool_health_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.inner.lock().created -= 1;
                self.ensure_min();
            }
        }
        Ok(())
    }

    fn create_handle(&self) -> StoreHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        StoreHandle::new(id, self.storage.clone())
    }

    fn ensure_min(&self) {
        let mut inner = self.inner.lock();
        while inner.created < self.config.min_size {
            let handle = self.create_handle();
            inner.created += 1;
            inner.idle.push_back(IdleConn {
                handle,
                idle_since: Instant::now(),
            });
        }
    }
}

/// Scoped checkout guard. Returns the connection to the pool on drop.
pub struct PooledConn {
    pool: Arc<ConnectionPool>,
    handle: Option<StoreHandle>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Deref for PooledConn {
    type Target = StoreHandle;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref().expect("handle present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Double release is unreachable through the guard; checkin logs
            // and counts it if pool internals ever regress.
            let _ = self.pool.checkin(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_pool(config: PoolConfig) -> (tempfile::TempDir, Arc<ConnectionPool>, Arc<Metrics>) {
        let temp_dir = tempdir().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path().join("test.db")).unwrap());
        let metrics = Metrics::new();
        let pool = ConnectionPool::new(config, storage, metrics.clone());
        (temp_dir, pool, metrics)
    }

    #[tokio::test]
    async fn acquire_up_to_max_then_block_until_release() {
        let (_dir, pool, _metrics) = test_pool(PoolConfig {
            min_size: 1,
            max_size: 2,
            max_waiters: 4,
            acquire_timeout: Duration::from_secs(2),
            ..Default::default()
        });

        let c1 = pool.acquire().await.unwrap();
        let _c2 = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 2);

        let blocked_pool = pool.clone();
        let blocked = tokio::spawn(async move { blocked_pool.acquire().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        drop(c1);
        let c3 = blocked.await.unwrap().unwrap();
        assert_eq!(pool.in_use(), 2);
        drop(c3);
    }

    #[tokio::test]
    async fn acquire_times_out_when_saturated() {
        let (_dir, pool, metrics) = test_pool(PoolConfig {
            min_size: 1,
            max_size: 1,
            max_waiters: 4,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, CoreError::PoolExhausted));
        assert_eq!(metrics.pool_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn full_wait_queue_rejects_immediately() {
        let (_dir, pool, _metrics) = test_pool(PoolConfig {
            min_size: 1,
            max_size: 1,
            max_waiters: 0,
            acquire_timeout: Duration::from_secs(5),
            ..Default::default()
        });

        let _held = pool.acquire().await.unwrap();
        let start = Instant::now();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, CoreError::PoolExhausted));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn broken_connection_is_discarded_and_replaced() {
        let (_dir, pool, metrics) = test_pool(PoolConfig {
            min_size: 1,
            max_size: 1,
            max_waiters: 4,
            acquire_timeout: Duration::from_secs(2),
            ..Default::default()
        });

        let conn = pool.acquire().await.unwrap();
        let broken_id = conn.id();
        conn.mark_broken();
        drop(conn);

        assert_eq!(metrics.pool_health_failures.load(Ordering::Relaxed), 1);

        // Replacement was created up to min_size with a fresh id.
        let replacement = pool.acquire().await.unwrap();
        assert_ne!(replacement.id(), broken_id);
    }

    #[tokio::test]
    async fn double_release_is_reported() {
        let (_dir, pool, metrics) = test_pool(PoolConfig::default());

        // A handle the pool never leased stands in for a second checkin of
        // an already-returned connection.
        let stray = StoreHandle::new(999, pool.storage.clone());
        let err = pool.checkin(stray).unwrap_err();
        assert!(matches!(err, CoreError::DoubleRelease(999)));
        assert_eq!(metrics.pool_double_releases.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn guard_releases_on_error_paths() {
        let (_dir, pool, _metrics) = test_pool(PoolConfig {
            min_size: 1,
            max_size: 1,
            max_waiters: 4,
            acquire_timeout: Duration::from_secs(2),
            ..Default::default()
        });

        async fn failing_op(pool: &Arc<ConnectionPool>) -> Result<()> {
            let conn = pool.acquire().await?;
            conn.storage().ping().map_err(CoreError::from)?;
            Err(CoreError::PoolExhausted) // propagate an unrelated failure
        }

        let _ = failing_op(&pool).await;
        assert_eq!(pool.in_use(), 0);

        // The connection made it back despite the early return.
        let again = pool.acquire().await.unwrap();
        drop(again);
    }
}
