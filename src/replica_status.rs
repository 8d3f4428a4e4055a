//! Aurora's per-replica session liveness, via `aurora_replica_status()`.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres, Row};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaStatus {
    pub server_id: String,
    pub session_id: String,
    pub last_updated: DateTime<Utc>,
}

const REPLICA_STATUS_QUERY: &str = "SELECT server_id, session_id, last_update_timestamp \
     FROM aurora_replica_status() \
     WHERE EXTRACT(EPOCH FROM (now() - last_update_timestamp)) <= 300 OR session_id = 'MASTER_SESSION_ID' \
     ORDER BY last_update_timestamp DESC";

/// Runs the Aurora replica-status query against `executor`.
///
/// # Errors
/// Returns [`Error::Database`] on any query failure — including on a
/// non-Aurora Postgres server, where `aurora_replica_status()` does not
/// exist.
pub async fn get_replica_status<'e, E>(executor: E) -> Result<Vec<ReplicaStatus>>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows = sqlx::query(REPLICA_STATUS_QUERY).fetch_all(executor).await?;
    rows.into_iter()
        .map(|row| {
            Ok(ReplicaStatus {
                server_id: row.try_get("server_id")?,
                session_id: row.try_get("session_id")?,
                last_updated: row.try_get("last_update_timestamp")?,
            })
        })
        .collect()
}
