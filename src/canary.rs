//! The canary row: `(id bigint, ts timestamp)`, one row per table by
//! precondition. The same shape backs both the pool-health canary and the
//! replication canary — only the table name differs.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres, Row};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Canary {
    pub id: i64,
    pub last_updated: DateTime<Utc>,
    /// Populated only by a read; `None` immediately after a bare update.
    pub diff_ms: Option<f64>,
}

/// Query helpers bound to a single canary table name.
pub struct CanaryTable {
    table: String,
}

impl CanaryTable {
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }

    /// `SELECT id, ts, diff_ms FROM <table>`.
    ///
    /// # Errors
    /// Returns [`Error::Database`] on any query failure or if the table is
    /// (against precondition) empty.
    pub async fn read<'e, E>(&self, executor: E) -> Result<Canary>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let query = format!(
            "SELECT id, ts, EXTRACT(EPOCH FROM (current_timestamp - ts)) * 1000 AS diff_ms FROM {}",
            self.table
        );
        let row = sqlx::query(&query).fetch_one(executor).await?;
        Ok(Canary {
            id: row.try_get("id")?,
            last_updated: row.try_get("ts")?,
            diff_ms: Some(row.try_get("diff_ms")?),
        })
    }

    /// `UPDATE <table> SET id=id+1, ts=CURRENT_TIMESTAMP`, returning the
    /// number of rows affected.
    ///
    /// # Errors
    /// Returns [`Error::Database`] on any query failure.
    pub async fn update<'e, E>(&self, executor: E) -> Result<u64>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let query = format!("UPDATE {} SET id = id + 1, ts = CURRENT_TIMESTAMP", self.table);
        let result = sqlx::query(&query).execute(executor).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_query_selects_diff_ms() {
        let table = CanaryTable::new("canary");
        assert_eq!(table.table, "canary");
    }
}
