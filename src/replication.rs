//! Replica-lag measurement: write a monotonic id to the replication canary
//! on the primary, then poll the replica until it observes that exact id,
//! bounded by a constant-backoff retry budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::canary::{Canary, CanaryTable};
use crate::error::{Error, Result};
use crate::metrics::{Metric, MetricsEmitter};
use crate::pool::ResilientPool;

/// Default constant backoff between read-replica polls.
pub const DEFAULT_BACKOFF_INTERVAL: Duration = Duration::from_millis(5);
/// Default number of polls before giving up on one lag measurement.
pub const DEFAULT_MAX_RETRIES: u64 = 500;
/// Default period between lag measurements.
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Configuration for [`ReplicationLagProbe`].
#[derive(Clone)]
pub struct ReplicationLagConfig {
    pub table: String,
    pub backoff_interval: Duration,
    pub max_retries: u64,
    pub check_period: Duration,
    pub metrics_emitter: Option<Arc<dyn MetricsEmitter>>,
}

impl ReplicationLagConfig {
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            backoff_interval: DEFAULT_BACKOFF_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            check_period: DEFAULT_CHECK_PERIOD,
            metrics_emitter: None,
        }
    }

    #[must_use]
    pub fn with_metrics_emitter(mut self, emitter: Arc<dyn MetricsEmitter>) -> Self {
        self.metrics_emitter = Some(emitter);
        self
    }

    #[must_use]
    pub fn with_metrics_emitter_opt(mut self, emitter: Option<Arc<dyn MetricsEmitter>>) -> Self {
        self.metrics_emitter = emitter;
        self
    }

    #[must_use]
    pub fn with_check_period(mut self, period: Duration) -> Self {
        self.check_period = if period.is_zero() { DEFAULT_CHECK_PERIOD } else { period };
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, interval: Duration, max_retries: u64) -> Self {
        self.backoff_interval = if interval.is_zero() {
            DEFAULT_BACKOFF_INTERVAL
        } else {
            interval
        };
        self.max_retries = if max_retries == 0 { DEFAULT_MAX_RETRIES } else { max_retries };
        self
    }
}

/// Periodically writes the replication canary on the read-write pool, then
/// polls the read-only pool until that exact id is visible there, emitting
/// the server-observed diff as the replication-lag metric.
///
/// Runs as a single background task for the lifetime of the owning
/// [`crate::store::Store`]; stopping it is cooperative via its own
/// `watch`-backed close signal, the same shape [`ResilientPool`]'s
/// validation loop uses — never a hard `abort`, so a write or read already
/// in flight when `stop` is called runs to completion instead of being cut
/// off mid-operation.
pub struct ReplicationLagProbe {
    handle: JoinHandle<()>,
    close_tx: watch::Sender<bool>,
}

impl ReplicationLagProbe {
    #[must_use]
    pub fn spawn(rw: ResilientPool, ro: ResilientPool, config: ReplicationLagConfig) -> Self {
        let (close_tx, mut close_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let canary = CanaryTable::new(config.table.clone());
            let mut ticker = tokio::time::interval(config.check_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if rw.is_closed() || ro.is_closed() {
                            break;
                        }
                        run_once(&rw, &ro, &canary, &config).await;
                    }
                    result = close_rx.changed() => {
                        if result.is_err() || *close_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self { handle, close_tx }
    }

    /// Signals the background task to stop at the next tick boundary and
    /// waits for it to exit. Does not forcibly cancel a write or read that
    /// is already in flight — it runs to completion against whichever
    /// underlying pool it already loaded, then the loop observes the close
    /// signal and exits before starting another iteration.
    pub async fn stop(self) {
        let _ = self.close_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn run_once(rw: &ResilientPool, ro: &ResilientPool, canary: &CanaryTable, config: &ReplicationLagConfig) {
    let written = match write_reference_id(rw, canary).await {
        Ok(id) => id,
        Err(error) => {
            warn!(%error, "failed to write replication canary, skipping this lag check");
            return;
        }
    };

    let mut observed_diff_ms = None;

    for attempt in 0..config.max_retries {
        if attempt > 0 {
            tokio::time::sleep(config.backoff_interval).await;
        }
        match read_reference(ro, canary).await {
            Ok(row) if row.id == written => {
                observed_diff_ms = Some(row.diff_ms.unwrap_or(0.0));
                break;
            }
            Ok(_) => {}
            Err(error) => warn!(%error, "failed to read replication canary from read-only pool, retrying"),
        }
    }

    if let Some(diff_ms) = observed_diff_ms {
        info!(diff_ms, "replica caught up to replication canary");
        if let Some(emitter) = &config.metrics_emitter {
            emitter.emit_metric(&Metric::new("pg_aurora_custom_replication_lag", diff_ms, ro.host()));
        }
    } else {
        warn!(
            written,
            retries = config.max_retries,
            "replica did not catch up to replication canary within retry budget"
        );
    }
}

async fn write_reference_id(rw: &ResilientPool, canary: &CanaryTable) -> Result<i64> {
    let mut conn = rw.acquire().await?;
    let affected = canary.update(&mut *conn).await?;
    if affected == 0 {
        return Err(Error::CanaryNotUpdated);
    }
    let row = canary.read(&mut *conn).await?;
    Ok(row.id)
}

async fn read_reference(ro: &ResilientPool, canary: &CanaryTable) -> Result<Canary> {
    let mut conn = ro.acquire().await?;
    canary.read(&mut *conn).await
}
