//! Bounded connection pool for the registry store
//!
//! Connections are handed out through an RAII guard that returns them to
//! the idle list (or closes them) on every exit path. The number of
//! connections open at once is capped by a semaphore; the idle list is
//! capped separately and pruned by age. Idle connections that have sat
//! longer than `test_on_borrow_after` are pinged before reuse.

use super::RegistryError;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

type Dialer = Box<dyn Fn() -> rusqlite::Result<Connection> + Send + Sync>;

/// Configuration for the store pool
#[derive(Debug, Clone)]
pub struct StorePoolConfig {
    /// Maximum connections checked out at once
    pub max_open: usize,
    /// Maximum idle connections kept for reuse
    pub max_idle: usize,
    /// Idle connections older than this are closed instead of reused
    pub idle_timeout: Duration,
    /// Idle connections older than this are pinged before reuse
    pub test_on_borrow_after: Duration,
}

impl Default for StorePoolConfig {
    fn default() -> Self {
        Self {
            max_open: 16,
            max_idle: 3,
            idle_timeout: Duration::from_secs(240),
            test_on_borrow_after: Duration::from_secs(10),
        }
    }
}

struct IdleConnection {
    conn: Connection,
    idle_since: Instant,
}

pub struct StorePool {
    dial: Dialer,
    idle: Mutex<VecDeque<IdleConnection>>,
    permits: Arc<Semaphore>,
    config: StorePoolConfig,
    dials: AtomicU64,
}

impl StorePool {
    /// Create a pool that opens new connections with `dial`
    pub fn new<F>(config: StorePoolConfig, dial: F) -> Arc<Self>
    where
        F: Fn() -> rusqlite::Result<Connection> + Send + Sync + 'static,
    {
        debug!(
            max_open = config.max_open,
            max_idle = config.max_idle,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Store pool initialized"
        );

        Arc::new(Self {
            dial: Box::new(dial),
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(config.max_open)),
            config,
            dials: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &StorePoolConfig {
        &self.config
    }

    /// Connections currently sitting in the idle list
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Connections currently checked out
    pub fn in_use(&self) -> usize {
        self.config.max_open - self.permits.available_permits()
    }

    /// Total connections opened over the pool's lifetime
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Run `op` on a pooled connection on the blocking thread pool
    ///
    /// Waits for a free slot when `max_open` connections are in use. A
    /// connection whose operation failed is closed rather than reused.
    ///
    /// `timeout` bounds the wait for a slot and for database locks. It is
    /// enforced inside the blocking section: when `RegistryError::Timeout`
    /// is returned, `op` either never ran or was refused its lock, so it
    /// had no effect.
    pub async fn run<T, F>(self: &Arc<Self>, timeout: Duration, op: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| RegistryError::Timeout(timeout))?
            .map_err(|_| RegistryError::Unavailable("store pool closed".to_string()))?;

        let pool = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.checkout(permit)?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RegistryError::Timeout(timeout));
            }
            if let Err(e) = conn.connection().busy_timeout(remaining) {
                conn.discard();
                return Err(e.into());
            }

            let result = op(conn.connection());
            if result.is_err() {
                conn.discard();
            }
            result.map_err(|e| {
                if is_busy(&e) {
                    RegistryError::Timeout(timeout)
                } else {
                    RegistryError::from(e)
                }
            })
        })
        .await
        .map_err(|e| RegistryError::Unavailable(format!("store task failed: {}", e)))?
    }

    fn checkout(self: Arc<Self>, permit: OwnedSemaphorePermit) -> Result<PooledConnection, RegistryError> {
        while let Some(candidate) = self.take_idle() {
            if candidate.idle_since.elapsed() < self.config.test_on_borrow_after
                || is_alive(&candidate.conn)
            {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(candidate.conn),
                    broken: false,
                    _permit: permit,
                });
            }
            debug!("Discarding idle store connection that failed liveness check");
        }

        let conn = (self.dial)().map_err(|e| {
            RegistryError::Unavailable(format!("failed to open store connection: {}", e))
        })?;
        self.dials.fetch_add(1, Ordering::Relaxed);

        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            broken: false,
            _permit: permit,
        })
    }

    /// Most recently returned idle connection, after closing expired ones
    fn take_idle(&self) -> Option<IdleConnection> {
        let mut idle = self.idle.lock();
        while idle
            .front()
            .is_some_and(|c| c.idle_since.elapsed() >= self.config.idle_timeout)
        {
            idle.pop_front();
        }
        idle.pop_back()
    }

    fn put_back(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push_back(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

fn is_alive(conn: &Connection) -> bool {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
}

/// A checked-out connection; returned to the pool when dropped
struct PooledConnection {
    pool: Arc<StorePool>,
    conn: Option<Connection>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn connection(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }

    fn discard(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.broken {
                self.pool.put_back(conn);
            }
        }
    }
}
