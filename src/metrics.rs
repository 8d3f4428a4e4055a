//! The metrics emitter contract.
//!
//! Kept intentionally tiny and opt-in: a [`ResilientPool`](crate::pool::ResilientPool)
//! or [`ReplicationLagProbe`](crate::replication::ReplicationLagProbe) without
//! a configured emitter emits nothing and pays no branch at the call site
//! beyond an `Option::as_ref` check — the same shape as the pluggable
//! [`crate::probe::Probe`] contract.

use prometheus::{GaugeVec, IntCounterVec, Opts, Registry};

use crate::stat::PoolStat;

/// A single `{key, value}` tag.
#[derive(Debug, Clone)]
pub struct Tag {
    pub key: &'static str,
    pub value: String,
}

/// A single `{key, value}` metric plus its ordered tags.
#[derive(Debug, Clone)]
pub struct Metric {
    pub key: &'static str,
    pub value: f64,
    pub tags: Vec<Tag>,
}

impl Metric {
    /// Builds a metric tagged with `pg_host` — every metric this crate
    /// emits carries that tag.
    #[must_use]
    pub fn new(key: &'static str, value: f64, host: &str) -> Self {
        Self {
            key,
            value,
            tags: vec![Tag {
                key: "pg_host",
                value: host.to_string(),
            }],
        }
    }
}

/// Abstract metrics sink. A pool snapshot and a single named metric are
/// distinct call shapes, so they get distinct methods rather than one
/// method over an enum.
pub trait MetricsEmitter: Send + Sync {
    /// Called once per validation tick with the current pool stats.
    fn emit_pool_snapshot(&self, snapshot: &PoolStat, host: &str);

    /// Called for a single named metric (`pg_aurora_custom_db_destroy_count`,
    /// `pg_aurora_custom_replication_lag`, ...).
    fn emit_metric(&self, metric: &Metric);
}

/// A ready-made [`MetricsEmitter`] that registers the canonical
/// `pg_aurora_custom_*` series on a `prometheus::Registry`.
pub struct PrometheusEmitter {
    idle_conn: GaugeVec,
    acquired_conn: GaugeVec,
    max_conn: GaugeVec,
    db_destroy_count: IntCounterVec,
    replication_lag: GaugeVec,
}

impl PrometheusEmitter {
    /// # Errors
    /// Returns an error if any metric fails to register with `registry`
    /// (for example, because of a name collision with an already-registered
    /// collector).
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let idle_conn = GaugeVec::new(
            Opts::new("pg_aurora_custom_idle_conn", "Idle connections in the resilient pool"),
            &["pg_host"],
        )?;
        let acquired_conn = GaugeVec::new(
            Opts::new(
                "pg_aurora_custom_acquired_conn",
                "Acquired connections in the resilient pool",
            ),
            &["pg_host"],
        )?;
        let max_conn = GaugeVec::new(
            Opts::new("pg_aurora_custom_max_conn", "Configured max connections"),
            &["pg_host"],
        )?;
        let db_destroy_count = IntCounterVec::new(
            Opts::new(
                "pg_aurora_custom_db_destroy_count",
                "Number of times the underlying pool has been swapped",
            ),
            &["pg_host"],
        )?;
        let replication_lag = GaugeVec::new(
            Opts::new(
                "pg_aurora_custom_replication_lag",
                "Replication lag observed by the canary probe, in milliseconds",
            ),
            &["pg_host"],
        )?;

        registry.register(Box::new(idle_conn.clone()))?;
        registry.register(Box::new(acquired_conn.clone()))?;
        registry.register(Box::new(max_conn.clone()))?;
        registry.register(Box::new(db_destroy_count.clone()))?;
        registry.register(Box::new(replication_lag.clone()))?;

        Ok(Self {
            idle_conn,
            acquired_conn,
            max_conn,
            db_destroy_count,
            replication_lag,
        })
    }
}

impl MetricsEmitter for PrometheusEmitter {
    fn emit_pool_snapshot(&self, snapshot: &PoolStat, host: &str) {
        self.idle_conn.with_label_values(&[host]).set(f64::from(snapshot.idle));
        self.acquired_conn
            .with_label_values(&[host])
            .set(f64::from(snapshot.acquired));
        self.max_conn.with_label_values(&[host]).set(f64::from(snapshot.max));
    }

    fn emit_metric(&self, metric: &Metric) {
        let host = metric
            .tags
            .iter()
            .find(|tag| tag.key == "pg_host")
            .map_or("", |tag| tag.value.as_str());

        match metric.key {
            "pg_aurora_custom_db_destroy_count" => {
                self.db_destroy_count.with_label_values(&[host]).inc();
            }
            "pg_aurora_custom_replication_lag" => {
                self.replication_lag.with_label_values(&[host]).set(metric.value);
            }
            _ => {
                tracing::debug!(key = metric.key, "unrecognized metric key, dropping");
            }
        }
    }
}
