//! A point-in-time snapshot of pool state.
//!
//! `acquired`/`idle`/`total`/`max` come straight off `sqlx::Pool`'s
//! `size()`/`num_idle()`; `acquire_count`/`acquire_duration` are tracked by
//! the resilient pool itself since `sqlx` does not surface them.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStat {
    pub acquire_count: u64,
    pub acquire_duration: Duration,
    pub acquired: u32,
    pub idle: u32,
    pub total: u32,
    pub max: u32,
}
