//! The probe contract: a short SQL check run against a leased, idle
//! connection to detect silent breakage.

use async_trait::async_trait;
use sqlx::{Postgres, Row, pool::PoolConnection};
use tracing::{error, info};

/// Validates a leased connection. Implementations must not retain the
/// connection reference after returning and must complete within the
/// deadline the caller wraps them in (see [`crate::pool::ResilientPool`]'s
/// validation loop, which applies `probe_timeout` via `tokio::time::timeout`).
#[async_trait]
pub trait Probe: Send + Sync {
    async fn run(&self, conn: &mut PoolConnection<Postgres>) -> bool;
}

/// `SELECT id, ts, (now()-ts)*1000 AS diff_ms FROM <table>`, true when
/// exactly one row scans cleanly.
pub struct ReadCanaryProbe {
    query: String,
}

impl ReadCanaryProbe {
    #[must_use]
    pub fn new(table: impl AsRef<str>) -> Self {
        Self {
            query: format!(
                "SELECT id, ts, EXTRACT(EPOCH FROM (now() - ts)) * 1000 AS diff_ms FROM {}",
                table.as_ref()
            ),
        }
    }
}

#[async_trait]
impl Probe for ReadCanaryProbe {
    async fn run(&self, conn: &mut PoolConnection<Postgres>) -> bool {
        let row = match sqlx::query(&self.query).fetch_one(conn.as_mut()).await {
            Ok(row) => row,
            Err(error) => {
                error!(%error, "read probe failed");
                return false;
            }
        };

        let id: Result<i64, _> = row.try_get("id");
        let diff_ms: Result<f64, _> = row.try_get("diff_ms");

        match (id, diff_ms) {
            (Ok(id), Ok(diff_ms)) => {
                info!(id, diff_ms, "healthcheck read canary");
                true
            }
            _ => {
                error!("read probe row did not scan cleanly");
                false
            }
        }
    }
}

/// `UPDATE <table> SET id=id+1, ts=CURRENT_TIMESTAMP RETURNING id, ts`, true
/// when the update returns exactly one row.
///
/// The "exactly one row" assumption holds only if the canary table is
/// seeded with a single row by deployment — the probe does not enforce
/// that precondition itself.
pub struct WriteCanaryProbe {
    query: String,
}

impl WriteCanaryProbe {
    #[must_use]
    pub fn new(table: impl AsRef<str>) -> Self {
        Self {
            query: format!(
                "UPDATE {} SET id = id + 1, ts = CURRENT_TIMESTAMP RETURNING id, ts",
                table.as_ref()
            ),
        }
    }
}

#[async_trait]
impl Probe for WriteCanaryProbe {
    async fn run(&self, conn: &mut PoolConnection<Postgres>) -> bool {
        match sqlx::query(&self.query).fetch_optional(conn.as_mut()).await {
            Ok(Some(row)) => {
                let id: Result<i64, _> = row.try_get("id");
                info!(?id, "healthcheck write canary");
                id.is_ok()
            }
            Ok(None) => {
                error!("write probe returned no row");
                false
            }
            Err(error) => {
                error!(%error, "write probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_probe_builds_table_qualified_query() {
        let probe = ReadCanaryProbe::new("canary");
        assert!(probe.query.contains("FROM canary"));
        assert!(probe.query.contains("diff_ms"));
    }

    #[test]
    fn write_probe_builds_table_qualified_query() {
        let probe = WriteCanaryProbe::new("replication_canary");
        assert_eq!(
            probe.query,
            "UPDATE replication_canary SET id = id + 1, ts = CURRENT_TIMESTAMP RETURNING id, ts"
        );
    }
}
