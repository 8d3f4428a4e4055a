//! Crate-level error taxonomy.
//!
//! Probe failures and swap-construction failures never surface here — they
//! are handled internally by the validation loop (see [`crate::pool`]).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid pool configuration: {0}")]
    Config(String),

    #[error("replication canary update affected zero rows")]
    CanaryNotUpdated,

    #[error("pool is closed")]
    Closed,

    #[error("read-only pool not configured and fallback to read-write is disabled")]
    ReadOnlyUnavailable,
}
