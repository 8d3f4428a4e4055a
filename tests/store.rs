#![allow(clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, ensure};
use aurora_resilient_pg::{AuroraConfig, Metric, MetricsEmitter, PoolStat, Store, StoreOptions};
use secrecy::SecretString;
use testcontainers_modules::testcontainers::core::IntoContainerPort;
use tokio::sync::Mutex as AsyncMutex;

/// Captures every metric emitted, for assertion.
#[derive(Default)]
struct RecordingEmitter {
    metrics: AsyncMutex<Vec<Metric>>,
}

impl MetricsEmitter for RecordingEmitter {
    fn emit_pool_snapshot(&self, _snapshot: &PoolStat, _host: &str) {}

    fn emit_metric(&self, metric: &Metric) {
        if let Ok(mut guard) = self.metrics.try_lock() {
            guard.push(metric.clone());
        }
    }
}

async fn build_store(host: &str, port: u16) -> Result<Store> {
    build_store_with_options(host, port, StoreOptions::default()).await
}

async fn build_store_with_options(host: &str, port: u16, options: StoreOptions) -> Result<Store> {
    let config = AuroraConfig::new("postgres", SecretString::from("postgres"), host, port, "postgres")?
        .with_ro_host(host);

    let options = options.with_lag_probe_tuning(Duration::from_millis(50), Duration::from_millis(5), 500);

    Ok(Store::new(&config, options).await?)
}

#[tokio::test]
async fn canary_round_trip_is_monotonic() -> Result<()> {
    let test_name = "canary_round_trip_is_monotonic";
    if !common::ensure_container_runtime_for_test(test_name)? {
        return Ok(());
    }

    let (container, seed_pool) = common::start_seeded_postgres().await?;
    let host = container.get_host().await?.to_string();
    let port = container.get_host_port_ipv4(5432.tcp()).await?;
    seed_pool.close().await;

    let store = build_store(&host, port).await?;

    let before = store.get_canary().await?;
    let mut previous_id = before.id;

    for _ in 0..5 {
        let affected = store.update_canary().await?;
        ensure!(affected == 1, "update_canary should affect exactly one row, got {affected}");

        let after = store.get_canary().await?;
        ensure!(
            after.id == previous_id + 1,
            "canary id should increase by exactly one: previous={previous_id}, observed={}",
            after.id
        );
        ensure!(after.diff_ms.is_some_and(|diff| (0.0..2000.0).contains(&diff)), "diff_ms should be within [0, 2000)ms");
        previous_id = after.id;
    }

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn replication_lag_is_measured_against_a_healthy_replica() -> Result<()> {
    let test_name = "replication_lag_is_measured_against_a_healthy_replica";
    if !common::ensure_container_runtime_for_test(test_name)? {
        return Ok(());
    }

    let (container, seed_pool) = common::start_seeded_postgres().await?;
    let host = container.get_host().await?.to_string();
    let port = container.get_host_port_ipv4(5432.tcp()).await?;
    seed_pool.close().await;

    let emitter = Arc::new(RecordingEmitter::default());
    let options = StoreOptions::default().with_metrics_emitter(Arc::clone(&emitter) as Arc<dyn MetricsEmitter>);
    let store = build_store_with_options(&host, port, options).await?;

    // The background lag probe (tuned to a 50ms check period) writes and
    // reads the replication canary on its own; a healthy single-node
    // "replica" should catch up within the first couple of ticks.
    let mut lag_value = None;
    for _ in 0..50 {
        let guard = emitter.metrics.lock().await;
        if let Some(metric) = guard.iter().find(|metric| metric.key == "pg_aurora_custom_replication_lag") {
            lag_value = Some(metric.value);
            break;
        }
        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let lag_value = lag_value.expect("expected a replication-lag gauge to be emitted");
    ensure!(lag_value >= 0.0, "replication lag gauge should be non-negative, got {lag_value}");

    // The primitives the probe consumes are independently correct too.
    let written = store.update_replication_canary().await?;
    let observed = store.get_replication_canary().await?;
    ensure!(observed.id >= written.id, "observed id should not be behind the written id");

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn replica_status_filters_stale_sessions_but_keeps_the_master() -> Result<()> {
    let test_name = "replica_status_filters_stale_sessions_but_keeps_the_master";
    if !common::ensure_container_runtime_for_test(test_name)? {
        return Ok(());
    }

    let (container, seed_pool) = common::start_seeded_postgres().await?;
    let host = container.get_host().await?.to_string();
    let port = container.get_host_port_ipv4(5432.tcp()).await?;

    sqlx::query(
        "INSERT INTO aurora_replica_status_rows (server_id, session_id, last_update_timestamp) VALUES
         ('replica-fresh', 'sess-fresh', CURRENT_TIMESTAMP),
         ('replica-recent', 'sess-recent', CURRENT_TIMESTAMP - INTERVAL '100 seconds'),
         ('replica-stale', 'sess-stale', CURRENT_TIMESTAMP - INTERVAL '400 seconds'),
         ('writer', 'MASTER_SESSION_ID', CURRENT_TIMESTAMP - INTERVAL '400 seconds')",
    )
    .execute(&seed_pool)
    .await?;
    seed_pool.close().await;

    let store = build_store(&host, port).await?;
    let statuses = store.get_replica_status(true).await?;

    ensure!(statuses.len() == 3, "expected exactly 3 rows (2 within 300s + master), got {}", statuses.len());
    ensure!(
        statuses.first().is_some_and(|row| row.session_id == "sess-fresh"),
        "rows should be ordered by last_update_timestamp descending"
    );
    ensure!(
        !statuses.iter().any(|row| row.session_id == "sess-stale"),
        "stale non-master session should be filtered out"
    );
    ensure!(
        statuses.iter().any(|row| row.session_id == "MASTER_SESSION_ID"),
        "master session should always be kept regardless of its timestamp"
    );

    store.close().await;
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent() -> Result<()> {
    let test_name = "close_is_idempotent";
    if !common::ensure_container_runtime_for_test(test_name)? {
        return Ok(());
    }

    let (container, seed_pool) = common::start_seeded_postgres().await?;
    let host = container.get_host().await?.to_string();
    let port = container.get_host_port_ipv4(5432.tcp()).await?;
    seed_pool.close().await;

    let store = build_store(&host, port).await?;
    store.close().await;
    store.close().await;
    ensure!(store.is_closed(), "store should report closed after close()");

    Ok(())
}
