//! Background validation loop: periodically leases every idle connection,
//! runs the configured probe against each one, force-closes the ones that
//! fail, and swaps in a freshly built pool once enough connections have
//! gone bad.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Postgres;
use sqlx::pool::PoolConnection;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::Inner;
use crate::metrics::Metric;

const ACQUIRE_ALL_IDLE_DEADLINE: Duration = Duration::from_millis(500);

pub(super) fn spawn(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut close_rx = inner.close_tx.subscribe();
        let mut ticker = tokio::time::interval(inner.config.validation_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_iteration(&inner).await;
                }
                result = close_rx.changed() => {
                    if result.is_err() || *close_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn run_iteration(inner: &Arc<Inner>) {
    let host = inner.config.host().to_string();
    let pool = super::ResilientPool { inner: Arc::clone(inner) };
    let snapshot = pool.stat();

    if let Some(emitter) = &inner.config.metrics_emitter {
        emitter.emit_pool_snapshot(&snapshot, &host);
    }

    if snapshot.idle == 0 {
        info!(host, "no idle connections to validate this tick");
        return;
    }

    let Some(probe) = inner.config.probe.as_ref() else {
        return;
    };

    let leased = pool.acquire_all_idle(ACQUIRE_ALL_IDLE_DEADLINE).await;
    let available_count = leased.len();
    let mut destroy_count = 0usize;

    for mut conn in leased {
        let healthy = match tokio::time::timeout(inner.config.probe_timeout, probe.run(&mut conn)).await {
            Ok(healthy) => healthy,
            Err(_) => {
                warn!(host, "probe timed out, treating connection as unhealthy");
                false
            }
        };

        if release_or_destroy(conn, healthy).await {
            destroy_count += 1;
        }
    }

    if destroy_count > 0 {
        info!(host, destroy_count, available_count, "validation loop destroyed unhealthy connections");
    }

    if should_swap(
        available_count,
        destroy_count,
        inner.config.min_available_connection_fail_size,
        inner.config.validation_count_destroy_trigger,
    ) {
        warn!(
            host,
            destroy_count, available_count, "destroy count exceeded trigger, swapping underlying pool"
        );
        swap_pool(inner, &host).await;
    }
}

/// A leased resource that can be force-closed. Implemented for
/// `PoolConnection<Postgres>`; abstracted out so the release-vs-destroy
/// bookkeeping in [`release_or_destroy`] can be exercised in a unit test
/// without a database.
#[async_trait]
trait Closable: Send {
    async fn close(self);
}

#[async_trait]
impl Closable for PoolConnection<Postgres> {
    async fn close(self) {
        let _ = self.close().await;
    }
}

/// Releases `conn` back to the pool if `healthy`, otherwise force-closes it.
/// Returns `true` iff it was destroyed.
///
/// Every connection leased via `acquire_all_idle` passes through here on its
/// way out, and Rust's ownership rules mean `conn` is consumed by exactly one
/// of `drop`/`close` below — there is no separate "release" call a future
/// refactor could forget, unlike a manual-lease API.
async fn release_or_destroy<C: Closable>(conn: C, healthy: bool) -> bool {
    if healthy {
        drop(conn);
        false
    } else {
        conn.close().await;
        true
    }
}

/// Pure threshold check: a swap is warranted iff strictly more idle
/// connections were available than `min_available_fail_size` AND strictly
/// more of them were destroyed than `destroy_trigger`. Kept free of any pool
/// state so the threshold math can be exercised without a database.
#[must_use]
pub(crate) const fn should_swap(
    available_count: usize,
    destroy_count: usize,
    min_available_fail_size: usize,
    destroy_trigger: usize,
) -> bool {
    available_count > min_available_fail_size && destroy_count > destroy_trigger
}

async fn swap_pool(inner: &Arc<Inner>, host: &str) {
    let new_pool = match super::rebuild_pool(&inner.config).await {
        Ok(pool) => pool,
        Err(_) => return,
    };

    let old_pool = inner.pool.swap(Arc::new(new_pool));
    old_pool.close().await;

    if let Some(emitter) = &inner.config.metrics_emitter {
        emitter.emit_metric(&Metric::new("pg_aurora_custom_db_destroy_count", 1.0, host));
    }

    info!(host, "underlying pool swapped");
}
