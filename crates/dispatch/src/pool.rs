//! Bounded connection pool
//!
//! Hands out at most `max_size` connections at a time. Connections are
//! opened lazily, validated when opened and again when taken from the idle
//! set, and returned automatically when the [`PooledConnection`] guard is
//! dropped. A connection marked invalid is closed instead of returned, and
//! a replacement is opened in the background.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::connection::{ConnectError, Connector};
use crate::serde_util::{duration_millis, env_parse};

/// Pause between attempts when a freshly opened connection is unusable
const REOPEN_BACKOFF: Duration = Duration::from_millis(10);

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of live connections
    pub max_size: usize,

    /// How long `acquire` waits for a free connection
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration with the given capacity
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// - `RECALC_POOL_SIZE`: maximum live connections (default:
    ///   `RECALC_MAX_CONCURRENCY`, then 10)
    /// - `RECALC_ACQUIRE_TIMEOUT_MS`: acquire timeout (default: 30000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_size: env_parse("RECALC_POOL_SIZE")
                .or_else(|| env_parse("RECALC_MAX_CONCURRENCY"))
                .unwrap_or(defaults.max_size),
            acquire_timeout: env_parse("RECALC_ACQUIRE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquire_timeout),
        }
    }

    /// Set the maximum number of live connections
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Connection pool errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// No connection became available in time
    #[error("connection pool exhausted (waited {waited:?})")]
    Exhausted { waited: Duration },

    /// Pool has been closed
    #[error("connection pool is closed")]
    Closed,

    /// Opening a new connection failed
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured maximum
    pub capacity: usize,
    /// Open (or opening) connections, idle or checked out
    pub live: usize,
    /// Connections waiting in the idle set
    pub idle: usize,
    /// Connections currently checked out
    pub in_use: usize,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    idle: Mutex<VecDeque<C::Connection>>,
    /// Open connections plus opens in progress; never exceeds `max_size`
    live: AtomicUsize,
    /// One permit per checked-out connection
    slots: Arc<Semaphore>,
    returned: Notify,
    closed: AtomicBool,
}

impl<C: Connector> PoolInner<C> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reserve room for one more live connection
    fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.config.max_size).then_some(live + 1)
            })
            .is_ok()
    }

    fn forget_one(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.returned.notify_waiters();
    }

    fn push_idle(self: &Arc<Self>, conn: C::Connection) {
        if self.is_closed() {
            self.close_in_background(conn);
            return;
        }
        self.idle.lock().push_back(conn);
        self.returned.notify_waiters();
    }

    fn close_in_background(self: &Arc<Self>, conn: C::Connection) {
        self.forget_one();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move { inner.connector.close(conn).await });
            }
            Err(_) => drop(conn),
        }
    }

    /// Close a broken connection and open a replacement in its place
    fn replace(self: &Arc<Self>, conn: C::Connection) {
        self.forget_one();

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no runtime available, dropping invalid connection without replacement");
                return;
            }
        };

        let inner = Arc::clone(self);
        handle.spawn(async move {
            inner.connector.close(conn).await;

            if inner.is_closed() || !inner.try_reserve() {
                return;
            }
            let reservation = LiveReservation::new(&inner);
            match inner.connector.open().await {
                Ok(mut fresh) => {
                    if !inner.connector.validate(&mut fresh).await {
                        warn!("replacement connection failed validation");
                        inner.connector.close(fresh).await;
                        return;
                    }
                    reservation.commit();
                    debug!("opened replacement connection");
                    inner.push_idle(fresh);
                }
                Err(e) => {
                    warn!(error = %e, "failed to open replacement connection");
                }
            }
        });
    }
}

/// Counts one slot of `live`; gives it back on drop unless committed
struct LiveReservation<'a, C: Connector> {
    inner: &'a PoolInner<C>,
    armed: bool,
}

impl<'a, C: Connector> LiveReservation<'a, C> {
    fn new(inner: &'a PoolInner<C>) -> Self {
        Self { inner, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for LiveReservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.forget_one();
        }
    }
}

/// Bounded pool of connections to the external data store
///
/// Cloning is cheap; clones share the same connections.
///
/// # Example
///
/// ```ignore
/// use recalc_dispatch::memory::InMemoryConnector;
/// use recalc_dispatch::pool::{ConnectionPool, PoolConfig};
///
/// let pool = ConnectionPool::new(InMemoryConnector::new(), PoolConfig::new(2));
///
/// let conn = pool.acquire().await?;
/// // ... use the connection
/// pool.release(conn);
/// ```
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool; no connections are opened until first use
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                slots: Arc::new(Semaphore::new(config.max_size)),
                config,
                idle: Mutex::new(VecDeque::new()),
                live: AtomicUsize::new(0),
                returned: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Acquire a connection using the configured timeout
    pub async fn acquire(&self) -> Result<PooledConnection<C>, PoolError> {
        self.acquire_timeout(self.inner.config.acquire_timeout)
            .await
    }

    /// Acquire a connection, waiting at most `timeout`
    ///
    /// Fails with [`PoolError::Exhausted`] when nothing frees up in time and
    /// with [`PoolError::Closed`] once the pool has been closed.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<C>, PoolError> {
        if self.inner.is_closed() {
            return Err(PoolError::Closed);
        }

        match tokio::time::timeout(timeout, self.checkout()).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Exhausted { waited: timeout }),
        }
    }

    async fn checkout(&self) -> Result<PooledConnection<C>, PoolError> {
        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        loop {
            if self.inner.is_closed() {
                return Err(PoolError::Closed);
            }

            // Register before inspecting state so a concurrent return is not missed
            let returned = self.inner.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();

            let candidate = self.inner.idle.lock().pop_front();
            if let Some(mut conn) = candidate {
                let reservation = LiveReservation::new(&self.inner);
                if self.inner.connector.validate(&mut conn).await {
                    reservation.commit();
                    return Ok(PooledConnection::new(Arc::clone(&self.inner), conn, permit));
                }
                debug!("discarding idle connection that failed validation");
                self.inner.connector.close(conn).await;
                drop(reservation);
                continue;
            }

            if self.inner.try_reserve() {
                let reservation = LiveReservation::new(&self.inner);
                let mut conn = self.inner.connector.open().await?;
                if self.inner.connector.validate(&mut conn).await {
                    reservation.commit();
                    debug!(live = self.inner.live.load(Ordering::Acquire), "opened connection");
                    return Ok(PooledConnection::new(Arc::clone(&self.inner), conn, permit));
                }
                warn!("new connection failed validation, retrying");
                self.inner.connector.close(conn).await;
                drop(reservation);
                // Keep the loop yielding so the acquire timeout can fire
                tokio::time::sleep(REOPEN_BACKOFF).await;
                continue;
            }

            // Every live connection is checked out or being replaced
            returned.await;
        }
    }

    /// Return a connection to the pool
    ///
    /// Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<C>) {
        drop(conn);
    }

    /// Close the pool
    ///
    /// Idle connections are closed now; checked-out connections are closed
    /// when returned. Further acquires fail with [`PoolError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.slots.close();
        self.inner.returned.notify_waiters();

        let drained: Vec<_> = self.inner.idle.lock().drain(..).collect();
        let count = drained.len();
        for conn in drained {
            self.inner.forget_one();
            self.inner.connector.close(conn).await;
        }
        info!(closed_idle = count, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Current pool counters
    pub fn stats(&self) -> PoolStats {
        let capacity = self.inner.config.max_size;
        PoolStats {
            capacity,
            live: self.inner.live.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
            in_use: capacity.saturating_sub(self.inner.slots.available_permits()),
        }
    }
}

/// A checked-out connection
///
/// Held by exactly one worker. Dropping it returns the connection to the
/// pool, or discards and replaces it if it was marked invalid.
pub struct PooledConnection<C: Connector> {
    pool: Arc<PoolInner<C>>,
    conn: Option<C::Connection>,
    valid: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    fn new(pool: Arc<PoolInner<C>>, conn: C::Connection, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            conn: Some(conn),
            valid: true,
            _permit: permit,
        }
    }

    /// Mark the connection as unusable; it will not be returned to the idle set
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("valid", &self.valid)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection used after release")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        // The permit is released after this body, once the connection is back
        if let Some(conn) = self.conn.take() {
            if self.valid {
                self.pool.push_idle(conn);
            } else {
                debug!("replacing invalid connection");
                self.pool.replace(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConnector;

    fn pool(max_size: usize) -> (ConnectionPool<InMemoryConnector>, InMemoryConnector) {
        let connector = InMemoryConnector::new();
        let pool = ConnectionPool::new(
            connector.clone(),
            PoolConfig::new(max_size).with_acquire_timeout(Duration::from_millis(50)),
        );
        (pool, connector)
    }

    /// Let spawned release/replacement tasks run
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_serialization() {
        let config = PoolConfig::new(4).with_acquire_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["acquire_timeout"], 1500);
        let parsed: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[tokio::test]
    async fn test_acquire_opens_lazily_and_reuses() {
        let (pool, connector) = pool(2);
        assert_eq!(connector.opened(), 0);

        let first = pool.acquire().await.unwrap();
        let id = first.id();
        drop(first);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let (pool, _) = pool(1);
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_zero_capacity_always_exhausted() {
        let (pool, connector) = pool(0);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let (pool, _) = pool(1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_connection_is_replaced() {
        let (pool, connector) = pool(1);
        let mut conn = pool.acquire().await.unwrap();
        let old_id = conn.id();
        conn.invalidate();
        drop(conn);
        settle().await;

        assert_eq!(connector.closed(), 1);
        assert_eq!(connector.opened(), 2);
        let stats = pool.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.idle, 1);

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), old_id);
    }

    #[tokio::test]
    async fn test_idle_connection_failing_validation_is_discarded() {
        let (pool, connector) = pool(1);
        let mut conn = pool.acquire().await.unwrap();
        let old_id = conn.id();
        conn.break_session();
        drop(conn);

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), old_id);
        assert_eq!(connector.closed(), 1);
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let (pool, connector) = pool(1);
        connector.set_fail_open(true);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Connect(_)));
        assert_eq!(pool.stats().live, 0);
        assert_eq!(pool.stats().in_use, 0);

        connector.set_fail_open(false);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_new_connection_failing_validation_is_not_handed_out() {
        let (pool, connector) = pool(1);
        connector.set_open_broken(true);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert!(connector.opened() >= 1);
        assert!(connector.closed() >= 1);
        assert_eq!(pool.stats().live, 0);
        assert_eq!(pool.stats().in_use, 0);

        connector.set_open_broken(false);
        let conn = pool.acquire().await.unwrap();
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_unusable_replacement_is_discarded() {
        let (pool, connector) = pool(1);
        let mut conn = pool.acquire().await.unwrap();
        conn.invalidate();
        connector.set_open_broken(true);
        drop(conn);
        settle().await;

        assert_eq!(connector.opened(), 2);
        assert_eq!(connector.closed(), 2);
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire_and_closes_idle() {
        let (pool, connector) = pool(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);

        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
        assert_eq!(connector.closed(), 1);

        drop(b);
        settle().await;
        assert_eq!(connector.closed(), 2);
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn test_checked_out_never_exceeds_capacity() {
        let pool = ConnectionPool::new(
            InMemoryConnector::new(),
            PoolConfig::new(3).with_acquire_timeout(Duration::from_secs(5)),
        );
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.stats().live <= 3);
        assert_eq!(pool.stats().in_use, 0);
    }
}
