//! A self-healing connection pool around a single Aurora endpoint.
//!
//! [`ResilientPool`] wraps an `sqlx::PgPool` behind an [`arc_swap::ArcSwap`]
//! so that ordinary query traffic never blocks on a mutex to read the
//! current pool, while a background task periodically validates idle
//! connections and, if enough of them are bad, builds a replacement pool
//! and swaps it in underneath callers that are already holding a
//! [`ResilientPool`] handle.

mod validator;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::stat::PoolStat;

struct Inner {
    pool: ArcSwap<PgPool>,
    config: PoolConfig,
    acquire_count: AtomicU64,
    acquire_duration_nanos: AtomicU64,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    validation_task: Mutex<Option<JoinHandle<()>>>,
}

/// A connection pool for one Aurora endpoint (primary or reader) that
/// monitors its own connections and rebuilds itself when enough of them go
/// bad to no longer trust the old pool.
///
/// Cloning is cheap: it shares the same underlying state, identical to
/// cloning an `sqlx::PgPool`.
#[derive(Clone)]
pub struct ResilientPool {
    inner: Arc<Inner>,
}

impl ResilientPool {
    /// Builds the underlying `sqlx` pool, pings it once to fail fast on
    /// unreachable hosts or bad credentials, and — if `config` carries a
    /// [`Probe`](crate::probe::Probe) — starts the background validation
    /// loop.
    ///
    /// # Errors
    /// Returns [`Error::Database`] if the initial connection cannot be
    /// established.
    pub async fn new(config: PoolConfig) -> Result<Self> {
        let pool = build_pool(&config).await?;

        let (close_tx, _close_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            pool: ArcSwap::from_pointee(pool),
            config,
            acquire_count: AtomicU64::new(0),
            acquire_duration_nanos: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_tx,
            validation_task: Mutex::new(None),
        });

        if inner.config.probe.is_some() {
            let handle = validator::spawn(Arc::clone(&inner));
            *inner.validation_task.lock().await = Some(handle);
        }

        Ok(Self { inner })
    }

    fn current(&self) -> Arc<PgPool> {
        self.inner.pool.load_full()
    }

    /// Tag used for logging and metrics (`pg_host`).
    #[must_use]
    pub fn host(&self) -> &str {
        self.inner.config.host()
    }

    /// Acquires a connection, tracking the acquisition in this pool's
    /// running `acquire_count`/`acquire_duration` totals.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] if the pool has been closed, or
    /// [`Error::Database`] if the underlying pool fails to hand out a
    /// connection.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let start = std::time::Instant::now();
        let conn = self.current().acquire().await?;
        self.inner.acquire_count.fetch_add(1, Ordering::Relaxed);
        self.inner
            .acquire_duration_nanos
            .fetch_add(u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX), Ordering::Relaxed);
        Ok(conn)
    }

    /// Runs a bare SQL statement with no expected result rows.
    ///
    /// # Errors
    /// Returns [`Error::Database`] on any query failure.
    pub async fn exec(&self, sql: &str) -> Result<u64> {
        let result = sqlx::query(sql).execute(&*self.current()).await?;
        Ok(result.rows_affected())
    }

    /// Runs a query and returns every row it produces.
    ///
    /// # Errors
    /// Returns [`Error::Database`] on any query failure.
    pub async fn query(&self, sql: &str) -> Result<Vec<PgRow>> {
        Ok(sqlx::query(sql).fetch_all(&*self.current()).await?)
    }

    /// Runs a query expected to return exactly one row.
    ///
    /// # Errors
    /// Returns [`Error::Database`] if the query fails or returns zero or more
    /// than one row.
    pub async fn query_one(&self, sql: &str) -> Result<PgRow> {
        Ok(sqlx::query(sql).fetch_one(&*self.current()).await?)
    }

    /// Begins a transaction on the current underlying pool.
    ///
    /// # Errors
    /// Returns [`Error::Database`] if the underlying pool cannot start a
    /// transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.current().begin().await?)
    }

    /// Begins a transaction and, if `isolation_level` is given, immediately
    /// sets it (`SET TRANSACTION ISOLATION LEVEL <level>`) before the caller
    /// issues any statements. `sqlx` has no typed transaction-options
    /// builder the way some other drivers do, so the level is applied as a
    /// plain statement against the open transaction.
    ///
    /// # Errors
    /// Returns [`Error::Database`] if the transaction cannot be started or
    /// the isolation-level statement fails.
    pub async fn begin_tx(&self, isolation_level: Option<&str>) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.begin().await?;
        if let Some(level) = isolation_level {
            sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {level}"))
                .execute(&mut *tx)
                .await?;
        }
        Ok(tx)
    }

    /// Leases a connection and hands it to `f`, returning whatever `f`
    /// returns. The connection is released back to the pool (or
    /// force-closed by `f` itself) once the returned future completes —
    /// there is no separate release call for the caller to forget.
    ///
    /// # Errors
    /// Returns [`Error::Closed`]/[`Error::Database`] from the acquire step,
    /// or whatever `f` itself returns.
    pub async fn acquire_func<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(PoolConnection<Postgres>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.acquire().await?;
        f(conn).await
    }

    /// Runs `statements` sequentially against one leased connection, summing
    /// rows affected. `sqlx`'s pool has no pipelined batch protocol; this
    /// still gives callers one connection acquisition for a related group of
    /// statements instead of one acquisition per statement.
    ///
    /// # Errors
    /// Returns [`Error::Database`] if any statement fails; statements before
    /// the failing one are not rolled back automatically — wrap this in a
    /// transaction via [`Self::begin`] if atomicity is required.
    pub async fn send_batch(&self, statements: &[&str]) -> Result<u64> {
        let mut conn = self.acquire().await?;
        let mut total = 0u64;
        for statement in statements {
            total += sqlx::query(statement).execute(&mut *conn).await?.rows_affected();
        }
        Ok(total)
    }

    /// Runs a `COPY ... FROM STDIN` against a leased connection, streaming
    /// `data` in as the copy payload. `sqlx` exposes raw `COPY` only on a
    /// single `PgConnection`, not on the pool directly, so this leases one.
    ///
    /// # Errors
    /// Returns [`Error::Database`] on any failure acquiring the connection
    /// or running the copy.
    pub async fn copy_in_raw(&self, statement: &str, data: &[u8]) -> Result<u64> {
        let mut conn = self.acquire().await?;
        let mut copy = conn.copy_in_raw(statement).await?;
        copy.send(data).await?;
        Ok(copy.finish().await?)
    }

    /// Pings the current underlying pool by acquiring and releasing a
    /// connection — does not itself run the configured probe.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] if the pool has been closed, or
    /// [`Error::Database`] if a connection cannot be acquired.
    pub async fn ping(&self) -> Result<()> {
        self.acquire().await.map(drop)
    }

    /// A snapshot of the underlying pool's current size and this
    /// `ResilientPool`'s lifetime acquisition counters.
    #[must_use]
    pub fn stat(&self) -> PoolStat {
        let pool = self.current();
        let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX);
        PoolStat {
            acquire_count: self.inner.acquire_count.load(Ordering::Relaxed),
            acquire_duration: Duration::from_nanos(self.inner.acquire_duration_nanos.load(Ordering::Relaxed)),
            acquired: pool.size().saturating_sub(idle),
            idle,
            total: pool.size(),
            max: pool.options().get_max_connections(),
        }
    }

    /// Config this pool was built from.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquires every currently-idle connection, bounded by `deadline`.
    /// Returns whatever was acquired before the deadline elapsed or the
    /// idle set was exhausted — never errors on a timeout.
    pub(crate) async fn acquire_all_idle(&self, deadline: Duration) -> Vec<PoolConnection<Postgres>> {
        let pool = self.current();
        let target = pool.num_idle();
        let mut leased = Vec::with_capacity(target);

        let _ = tokio::time::timeout(deadline, async {
            while leased.len() < target {
                match pool.try_acquire() {
                    Some(conn) => leased.push(conn),
                    None => break,
                }
            }
        })
        .await;

        leased
    }

    /// True once [`Self::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops the background validation loop (if running) and closes the
    /// underlying pool. Idempotent: calling this more than once is a no-op
    /// after the first call.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.inner.close_tx.send(true);
        if let Some(handle) = self.inner.validation_task.lock().await.take() {
            let _ = handle.await;
        }

        self.current().close().await;
        info!(host = self.host(), "resilient pool closed");
    }
}

async fn build_pool(config: &PoolConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .test_before_acquire(true)
        .idle_timeout(Some(config.pool_health_check_period))
        .connect_with(config.connect_options.clone())
        .await?;

    let mut conn = pool.acquire().await?;
    sqlx::Executor::execute(&mut *conn, "SELECT 1").await?;
    drop(conn);

    Ok(pool)
}

pub(crate) async fn rebuild_pool(config: &PoolConfig) -> Result<PgPool> {
    match build_pool(config).await {
        Ok(pool) => Ok(pool),
        Err(error) => {
            warn!(host = config.host(), %error, "failed to build replacement pool, keeping current pool");
            Err(error)
        }
    }
}

#[cfg(test)]
impl ResilientPool {
    /// Builds a `ResilientPool` around a lazily-connected `sqlx` pool (no
    /// network I/O at construction, and none unless a connection is actually
    /// acquired) with a background task subscribed to its close signal,
    /// standing in for the real validation task. Lets [`Self::close`]'s
    /// idempotence be exercised without a database.
    fn new_for_close_test() -> Self {
        let connect_options = sqlx::postgres::PgConnectOptions::new();
        let pool = PgPoolOptions::new().connect_lazy_with(connect_options.clone());

        let (close_tx, mut close_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                if close_rx.changed().await.is_err() || *close_rx.borrow() {
                    break;
                }
            }
        });

        let inner = Arc::new(Inner {
            pool: ArcSwap::from_pointee(pool),
            config: PoolConfig::new("test-host", connect_options),
            acquire_count: AtomicU64::new(0),
            acquire_duration_nanos: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_tx,
            validation_task: Mutex::new(Some(handle)),
        });

        Self { inner }
    }
}
