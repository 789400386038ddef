//! Connection pool for pipe-rdbc
//!
//! A bounded pool bound to one source:
//! - Fixed maximum size and minimum idle count
//! - Liveness probe run once on every new physical connection
//! - Fail-fast creation: building a pool opens its first connection
//! - Statistics for observability
//!
//! # Example
//!
//! ```rust,ignore
//! use pipe_rdbc::prelude::*;
//! use pipe_rdbc::postgres::PgConnectionFactory;
//!
//! let pool = SimpleConnectionPool::new(
//!     PoolConfig::new(ConnectionParams::new("jdbc:postgresql://localhost/db")).with_max_size(10),
//!     Arc::new(PgConnectionFactory),
//! ).await?;
//!
//! let conn = pool.get().await?;
//! conn.query("select 1").await?;
//! conn.release().await;
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionFactory, ConnectionParams};
use crate::error::{Error, Result};

/// Connection pool trait
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Get a connection from the pool
    async fn get(&self) -> Result<PooledConnection>;

    /// Return a connection to the pool
    async fn return_connection(&self, conn: Box<dyn Connection>);

    /// Drop a connection that can no longer be reused
    async fn discard_connection(&self, conn: Box<dyn Connection>);

    /// Get current pool size
    fn size(&self) -> usize;

    /// Get number of idle connections
    fn idle(&self) -> usize;

    /// Get number of connections in use
    fn in_use(&self) -> usize {
        self.size().saturating_sub(self.idle())
    }

    /// Get pool statistics
    fn stats(&self) -> PoolStats;

    /// Close all connections and shutdown the pool
    async fn close(&self) -> Result<()>;
}

/// A connection borrowed from the pool.
///
/// Prefer [`PooledConnection::release`] so the connection is back in the
/// pool before the caller continues. Dropping the handle returns it from a
/// spawned task instead.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<dyn ConnectionPool>,
}

impl PooledConnection {
    /// Wrap a connection borrowed from `pool`
    pub fn new(conn: Box<dyn Connection>, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Return the connection to the pool and wait until it is idle again
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn).await;
        }
    }

    /// Close the connection instead of returning it
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard_connection(conn).await;
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        // Only `release`, `discard` and `drop` take the connection, and all
        // of them consume the handle.
        match &self.conn {
            Some(conn) => conn.as_ref(),
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move { pool.return_connection(conn).await });
        }
    }
}

/// Liveness probe run once per new physical connection
pub const DEFAULT_INIT_SQL: &str = "select 1";

/// Idle time after which a connection is validated before reuse
pub const DEFAULT_VALIDATION_WINDOW: Duration = Duration::from_millis(500);

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection parameters
    pub params: ConnectionParams,
    /// Connections opened eagerly and kept idle
    pub min_idle: usize,
    /// Upper bound on open connections
    pub max_size: usize,
    /// How long `get` waits for a free slot
    pub acquire_timeout: Duration,
    /// Statement run on every new connection before first use
    pub init_sql: Option<String>,
    /// Connections idle for longer are validated before reuse; `None` never validates
    pub validation_window: Option<Duration>,
}

impl PoolConfig {
    /// Pool config for one source with default sizing
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            min_idle: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            init_sql: Some(DEFAULT_INIT_SQL.to_string()),
            validation_window: Some(DEFAULT_VALIDATION_WINDOW),
        }
    }

    /// Set the number of connections kept idle
    pub fn with_min_idle(mut self, size: usize) -> Self {
        self.min_idle = size;
        self
    }

    /// Set the connection limit
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set how long `get` waits for a free slot
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the liveness probe statement (`None` disables it)
    pub fn with_init_sql(mut self, sql: Option<String>) -> Self {
        self.init_sql = sql;
        self
    }

    /// Set the idle validation window
    pub fn with_validation_window(mut self, window: Option<Duration>) -> Self {
        self.validation_window = window;
        self
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Physical connections opened
    pub connections_created: u64,
    /// Physical connections closed
    pub connections_closed: u64,
    /// Connections handed back for reuse
    pub connections_returned: u64,
    /// Successful `get` calls
    pub acquisitions: u64,
    /// `get` calls that timed out waiting for a slot
    pub exhausted_count: u64,
    /// Time spent inside successful `get` calls (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Failed liveness probes and idle validations
    pub probe_failures: u64,
}

impl PoolStats {
    /// Mean time spent in `get`, in milliseconds
    pub fn avg_wait_ms(&self) -> f64 {
        match self.acquisitions {
            0 => 0.0,
            n => self.total_wait_time_ms as f64 / n as f64,
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    closed: AtomicU64,
    returned: AtomicU64,
    acquisitions: AtomicU64,
    exhausted: AtomicU64,
    wait_ms: AtomicU64,
    probe_failures: AtomicU64,
}

impl PoolCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn acquired(&self, waited: Duration) {
        Self::bump(&self.acquisitions);
        self.wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.created.load(Ordering::Relaxed),
            connections_closed: self.closed.load(Ordering::Relaxed),
            connections_returned: self.returned.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted.load(Ordering::Relaxed),
            total_wait_time_ms: self.wait_ms.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
        }
    }
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    since: Instant,
}

// ============================================================================
// SimpleConnectionPool
// ============================================================================

/// A bounded connection pool.
///
/// A semaphore with `max_size` permits caps the number of connections; a
/// permit is held for as long as a connection is borrowed. Idle connections
/// are reused LIFO.
pub struct SimpleConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<IdleConnection>>,
    idle_count: AtomicUsize,
    slots: Semaphore,
    open: AtomicUsize,
    counters: PoolCounters,
    shut_down: AtomicBool,
    this: OnceCell<Weak<Self>>,
}

impl SimpleConnectionPool {
    /// Create a new connection pool.
    ///
    /// Opens `max(min_idle, 1)` connections eagerly. Failing to open the
    /// first one fails the whole pool, so unreachable sources and bad
    /// credentials surface here rather than on first use.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        if config.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }

        let pool = Arc::new(Self {
            slots: Semaphore::new(config.max_size),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            idle_count: AtomicUsize::new(0),
            config,
            factory,
            open: AtomicUsize::new(0),
            counters: PoolCounters::default(),
            shut_down: AtomicBool::new(false),
            this: OnceCell::new(),
        });
        let _ = pool.this.set(Arc::downgrade(&pool));

        let first = pool.open_connection().await?;
        pool.push_idle(first).await;

        let warm = pool.config.min_idle.min(pool.config.max_size);
        for _ in 1..warm {
            match pool.open_connection().await {
                Ok(conn) => pool.push_idle(conn).await,
                Err(e) => {
                    warn!("Could not pre-populate pool: {}", e);
                    break;
                }
            }
        }

        debug!(
            "Created pool for {:?} with {} idle connection(s)",
            pool.config.params,
            pool.idle()
        );
        Ok(pool)
    }

    /// Open a physical connection and run the liveness probe on it
    async fn open_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self.factory.connect(&self.config.params).await?;

        if let Some(sql) = &self.config.init_sql {
            if let Err(e) = conn.query(sql).await {
                PoolCounters::bump(&self.counters.probe_failures);
                let _ = conn.close().await;
                return Err(Error::connection_with_source(
                    format!("liveness probe [{}] failed", sql),
                    e,
                ));
            }
        }

        self.open.fetch_add(1, Ordering::AcqRel);
        PoolCounters::bump(&self.counters.created);
        Ok(conn)
    }

    async fn push_idle(&self, conn: Box<dyn Connection>) {
        let mut idle = self.idle.lock().await;
        idle.push(IdleConnection {
            conn,
            since: Instant::now(),
        });
        self.idle_count.store(idle.len(), Ordering::Release);
    }

    async fn pop_idle(&self) -> Option<IdleConnection> {
        let mut idle = self.idle.lock().await;
        let entry = idle.pop();
        self.idle_count.store(idle.len(), Ordering::Release);
        entry
    }

    /// Take the most recently used idle connection that is still alive
    async fn reuse_idle(&self) -> Option<Box<dyn Connection>> {
        while let Some(entry) = self.pop_idle().await {
            let stale = self
                .config
                .validation_window
                .is_some_and(|window| entry.since.elapsed() >= window);
            if stale && !entry.conn.is_valid().await {
                debug!("Dropping dead idle connection for {:?}", self.config.params);
                PoolCounters::bump(&self.counters.probe_failures);
                let _ = entry.conn.close().await;
                self.forget_connection();
                continue;
            }
            return Some(entry.conn);
        }
        None
    }

    fn forget_connection(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        PoolCounters::bump(&self.counters.closed);
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl std::fmt::Debug for SimpleConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleConnectionPool")
            .field("config", &self.config)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ConnectionPool for SimpleConnectionPool {
    async fn get(&self) -> Result<PooledConnection> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "pool is closed".to_string(),
            });
        }

        let started = Instant::now();
        let slot = match tokio::time::timeout(self.config.acquire_timeout, self.slots.acquire()).await
        {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => {
                return Err(Error::PoolExhausted {
                    message: "pool is closed".to_string(),
                })
            }
            Err(_) => {
                PoolCounters::bump(&self.counters.exhausted);
                return Err(Error::PoolExhausted {
                    message: format!(
                        "no connection available within {}ms",
                        self.config.acquire_timeout.as_millis()
                    ),
                });
            }
        };

        let conn = match self.reuse_idle().await {
            Some(conn) => conn,
            // Dropping `slot` on this path frees it again.
            None => self.open_connection().await?,
        };
        let this = self.this.get().and_then(Weak::upgrade).ok_or_else(|| {
            Error::PoolExhausted {
                message: "pool has been dropped".to_string(),
            }
        })?;

        self.counters.acquired(started.elapsed());
        // The slot stays taken until the connection comes back.
        slot.forget();
        Ok(PooledConnection::new(conn, this))
    }

    async fn return_connection(&self, conn: Box<dyn Connection>) {
        self.slots.add_permits(1);

        if self.shut_down.load(Ordering::Acquire) {
            let _ = conn.close().await;
            self.forget_connection();
            return;
        }

        PoolCounters::bump(&self.counters.returned);
        self.push_idle(conn).await;
    }

    async fn discard_connection(&self, conn: Box<dyn Connection>) {
        self.slots.add_permits(1);
        let _ = conn.close().await;
        self.forget_connection();
    }

    fn size(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    fn idle(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    async fn close(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::Release);

        let mut idle = self.idle.lock().await;
        for entry in idle.drain(..) {
            let _ = entry.conn.close().await;
            self.forget_connection();
        }
        self.idle_count.store(0, Ordering::Release);

        Ok(())
    }
}
