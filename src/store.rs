//! The `Store` facade: owns the read-write and (optional) read-only resilient
//! pools, starts the replication-lag probe when both exist, and exposes the
//! read-only surface an HTTP layer would render — health, pool stats, and the
//! two canaries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use crate::canary::{Canary, CanaryTable};
use crate::config::{
    AuroraConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_MIN_AVAILABLE_CONNECTION_FAIL_SIZE, DEFAULT_MIN_CONNECTIONS,
    DEFAULT_POOL_HEALTH_CHECK_PERIOD, DEFAULT_PROBE_TIMEOUT, DEFAULT_VALIDATION_COUNT_DESTROY_TRIGGER,
    DEFAULT_VALIDATION_PERIOD, PoolConfig, ReadFallback,
};
use crate::error::{Error, Result};
use crate::metrics::MetricsEmitter;
use crate::pool::ResilientPool;
use crate::probe::{Probe, ReadCanaryProbe, WriteCanaryProbe};
use crate::replica_status::{self, ReplicaStatus};
use crate::replication::{self, ReplicationLagConfig, ReplicationLagProbe};
use crate::stat::PoolStat;

/// Table name the pool-health canary lives in, absent an override.
pub const DEFAULT_CANARY_TABLE: &str = "canary";
/// Table name the replication-lag canary lives in, absent an override.
pub const DEFAULT_REPLICATION_CANARY_TABLE: &str = "replication_canary";

/// Everything [`Store::new`] needs beyond the bare connection parameters:
/// pool sizing, validation thresholds, canary table names, and the policy
/// for read operations when no RO endpoint is configured.
///
/// Every field has a default matching [`crate::config::PoolConfig`]'s and
/// [`crate::replication::ReplicationLagConfig`]'s own documented defaults —
/// `StoreOptions::default()` is a reasonable starting point for production.
#[derive(Clone)]
pub struct StoreOptions {
    pub canary_table: String,
    pub replication_canary_table: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub probe_timeout: Duration,
    pub validation_period: Duration,
    pub pool_health_check_period: Duration,
    pub min_available_connection_fail_size: usize,
    pub validation_count_destroy_trigger: usize,
    pub metrics_emitter: Option<Arc<dyn MetricsEmitter>>,
    pub read_fallback: ReadFallback,
    pub lag_check_period: Duration,
    pub lag_backoff_interval: Duration,
    pub lag_max_retries: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            canary_table: DEFAULT_CANARY_TABLE.to_string(),
            replication_canary_table: DEFAULT_REPLICATION_CANARY_TABLE.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            validation_period: DEFAULT_VALIDATION_PERIOD,
            pool_health_check_period: DEFAULT_POOL_HEALTH_CHECK_PERIOD,
            min_available_connection_fail_size: DEFAULT_MIN_AVAILABLE_CONNECTION_FAIL_SIZE,
            validation_count_destroy_trigger: DEFAULT_VALIDATION_COUNT_DESTROY_TRIGGER,
            metrics_emitter: None,
            read_fallback: ReadFallback::default(),
            lag_check_period: replication::DEFAULT_CHECK_PERIOD,
            lag_backoff_interval: replication::DEFAULT_BACKOFF_INTERVAL,
            lag_max_retries: replication::DEFAULT_MAX_RETRIES,
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub fn with_canary_tables(mut self, canary: impl Into<String>, replication_canary: impl Into<String>) -> Self {
        self.canary_table = canary.into();
        self.replication_canary_table = replication_canary.into();
        self
    }

    #[must_use]
    pub fn with_pool_sizing(mut self, max_connections: u32, min_connections: u32) -> Self {
        self.max_connections = max_connections;
        self.min_connections = min_connections;
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, min_available_fail_size: usize, destroy_trigger: usize) -> Self {
        self.min_available_connection_fail_size = min_available_fail_size;
        self.validation_count_destroy_trigger = destroy_trigger;
        self
    }

    #[must_use]
    pub fn with_metrics_emitter(mut self, emitter: Arc<dyn MetricsEmitter>) -> Self {
        self.metrics_emitter = Some(emitter);
        self
    }

    #[must_use]
    pub fn with_read_fallback(mut self, policy: ReadFallback) -> Self {
        self.read_fallback = policy;
        self
    }

    #[must_use]
    pub fn with_lag_probe_tuning(mut self, check_period: Duration, backoff_interval: Duration, max_retries: u64) -> Self {
        self.lag_check_period = check_period;
        self.lag_backoff_interval = backoff_interval;
        self.lag_max_retries = max_retries;
        self
    }

    fn pool_config(&self, host: impl Into<String>, connect_options: sqlx::postgres::PgConnectOptions, probe: Arc<dyn Probe>) -> PoolConfig {
        let mut config = PoolConfig::new(host, connect_options)
            .with_max_connections(self.max_connections)
            .with_min_connections(self.min_connections)
            .with_probe(probe)
            .with_probe_timeout(self.probe_timeout)
            .with_validation_period(self.validation_period)
            .with_pool_health_check_period(self.pool_health_check_period)
            .with_thresholds(self.min_available_connection_fail_size, self.validation_count_destroy_trigger);
        if let Some(emitter) = &self.metrics_emitter {
            config = config.with_metrics_emitter(Arc::clone(emitter));
        }
        config
    }
}

/// Owns the two [`ResilientPool`]s (primary, replica) behind an Aurora
/// endpoint pair, starts the replication-lag probe when both are present,
/// and exposes the read-only operations an HTTP layer renders as responses.
///
/// Cloning is cheap (both pools and the canary table handles are cheap to
/// clone), but `Store` is normally held behind a single `Arc` by the
/// embedding application.
pub struct Store {
    rw: ResilientPool,
    ro: Option<ResilientPool>,
    lag_probe: Mutex<Option<ReplicationLagProbe>>,
    read_fallback: ReadFallback,
    canary: CanaryTable,
    replication_canary: CanaryTable,
    closed: AtomicBool,
}

impl Store {
    /// Builds the RW pool (write probe) and, if `aurora` carries a replica
    /// host, the RO pool (read probe); pings both; starts the
    /// replication-lag probe when both pools exist.
    ///
    /// # Errors
    /// Returns [`Error::Database`] if either pool fails to connect, or
    /// [`Error::Config`] if `aurora`'s DSN cannot be parsed.
    pub async fn new(aurora: &AuroraConfig, options: StoreOptions) -> Result<Self> {
        let write_probe: Arc<dyn Probe> = Arc::new(WriteCanaryProbe::new(options.canary_table.clone()));
        let rw_config = options.pool_config(aurora.host.clone(), aurora.rw_connect_options()?, write_probe);
        let rw = ResilientPool::new(rw_config).await?;

        let ro = match &aurora.ro_host {
            Some(ro_host) => {
                let read_probe: Arc<dyn Probe> = Arc::new(ReadCanaryProbe::new(options.canary_table.clone()));
                let ro_config = options.pool_config(ro_host.clone(), aurora.ro_connect_options()?, read_probe);
                Some(ResilientPool::new(ro_config).await?)
            }
            None => None,
        };

        let lag_probe = ro.as_ref().map(|ro| {
            let lag_config = ReplicationLagConfig::new(options.replication_canary_table.clone())
                .with_metrics_emitter_opt(options.metrics_emitter.clone())
                .with_check_period(options.lag_check_period)
                .with_backoff(options.lag_backoff_interval, options.lag_max_retries);
            ReplicationLagProbe::spawn(rw.clone(), ro.clone(), lag_config)
        });

        Ok(Self {
            rw,
            ro,
            lag_probe: Mutex::new(lag_probe),
            read_fallback: options.read_fallback,
            canary: CanaryTable::new(options.canary_table),
            replication_canary: CanaryTable::new(options.replication_canary_table),
            closed: AtomicBool::new(false),
        })
    }

    /// The read-write pool. Always present.
    #[must_use]
    pub fn rw(&self) -> &ResilientPool {
        &self.rw
    }

    /// The read-only pool, if one was configured.
    #[must_use]
    pub fn ro(&self) -> Option<&ResilientPool> {
        self.ro.as_ref()
    }

    fn resolve_read_pool(&self, ro: bool) -> Result<&ResilientPool> {
        if !ro {
            return Ok(&self.rw);
        }
        match (&self.ro, self.read_fallback) {
            (Some(pool), _) => Ok(pool),
            (None, ReadFallback::Warn) => {
                warn!("RO pool not configured, falling back to RW pool for a read-only request");
                Ok(&self.rw)
            }
            (None, ReadFallback::Disabled) => Err(Error::ReadOnlyUnavailable),
        }
    }

    /// Runs the Aurora `aurora_replica_status()` query. `ro` selects the
    /// read-only pool; if it is absent this falls back to RW with a warning
    /// (or fails, if configured with [`ReadFallback::Disabled`]).
    ///
    /// # Errors
    /// Returns [`Error::ReadOnlyUnavailable`] if `ro` is requested, no RO pool
    /// exists, and fallback is disabled; otherwise surfaces the underlying
    /// pool's query errors.
    pub async fn get_replica_status(&self, ro: bool) -> Result<Vec<ReplicaStatus>> {
        let pool = self.resolve_read_pool(ro)?;
        let mut conn = pool.acquire().await?;
        replica_status::get_replica_status(&mut *conn).await
    }

    /// A point-in-time snapshot of the selected pool's connection stats.
    ///
    /// # Errors
    /// Returns [`Error::ReadOnlyUnavailable`] under the same condition as
    /// [`Self::get_replica_status`].
    pub fn get_connection_pool_stats(&self, ro: bool) -> Result<PoolStat> {
        Ok(self.resolve_read_pool(ro)?.stat())
    }

    /// Reads the pool-health canary from the read-only pool (falling back to
    /// RW per [`ReadFallback`]).
    ///
    /// # Errors
    /// Returns [`Error::Database`] on query failure, or
    /// [`Error::ReadOnlyUnavailable`] per [`Self::get_replica_status`].
    pub async fn get_canary(&self) -> Result<Canary> {
        let pool = self.resolve_read_pool(true)?;
        let mut conn = pool.acquire().await?;
        self.canary.read(&mut *conn).await
    }

    /// Increments the pool-health canary on the read-write pool, returning
    /// rows affected (`1` under the deployment precondition of a single
    /// canary row).
    ///
    /// # Errors
    /// Returns [`Error::Database`] on query failure.
    pub async fn update_canary(&self) -> Result<u64> {
        let mut conn = self.rw.acquire().await?;
        self.canary.update(&mut *conn).await
    }

    /// Reads the replication canary from the read-only pool (falling back to
    /// RW per [`ReadFallback`]) — the same query the lag probe uses to
    /// detect when the replica has caught up.
    ///
    /// # Errors
    /// Returns [`Error::Database`] on query failure, or
    /// [`Error::ReadOnlyUnavailable`] per [`Self::get_replica_status`].
    pub async fn get_replication_canary(&self) -> Result<Canary> {
        let pool = self.resolve_read_pool(true)?;
        let mut conn = pool.acquire().await?;
        self.replication_canary.read(&mut *conn).await
    }

    /// Increments the replication canary on the read-write pool and reads it
    /// back immediately, on the same pool — the reference id the lag probe
    /// then waits to observe on RO.
    ///
    /// # Errors
    /// Returns [`Error::CanaryNotUpdated`] if the update affected zero rows,
    /// or [`Error::Database`] on any query failure.
    pub async fn update_replication_canary(&self) -> Result<Canary> {
        let mut conn = self.rw.acquire().await?;
        let affected = self.replication_canary.update(&mut *conn).await?;
        if affected == 0 {
            return Err(Error::CanaryNotUpdated);
        }
        self.replication_canary.read(&mut *conn).await
    }

    /// True once [`Self::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the lag probe (if running), then closes both resilient pools.
    /// Idempotent: calling this more than once is a no-op after the first
    /// call.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(probe) = self.lag_probe.lock().await.take() {
            probe.stop().await;
        }

        self.rw.close().await;
        if let Some(ro) = &self.ro {
            ro.close().await;
        }
    }
}
