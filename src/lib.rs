//! A resilient Postgres client for Amazon Aurora primary/replica topologies.
//!
//! [`pool::ResilientPool`] wraps a standard `sqlx::PgPool`, periodically
//! validating idle connections with an application-defined [`probe::Probe`]
//! and atomically swapping the underlying pool when enough of them fail.
//! [`replication::ReplicationLagProbe`] measures replica lag end-to-end by
//! writing a canary row on the primary and timing its arrival on the
//! replica. [`store::Store`] ties both resilient pools together behind a
//! single facade.
//!
//! This crate does not install a logging subscriber, parse environment
//! configuration, or expose an HTTP surface — those are the embedding
//! application's job. It only emits `tracing` events and validated,
//! constructed types.

pub mod canary;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod probe;
pub mod replica_status;
pub mod replication;
pub mod stat;
pub mod store;

pub use canary::{Canary, CanaryTable};
pub use config::{AuroraConfig, PoolConfig, ReadFallback, TlsConfig};
pub use error::{Error, Result};
pub use metrics::{Metric, MetricsEmitter, PrometheusEmitter, Tag};
pub use pool::ResilientPool;
pub use probe::{Probe, ReadCanaryProbe, WriteCanaryProbe};
pub use replica_status::ReplicaStatus;
pub use replication::{ReplicationLagConfig, ReplicationLagProbe};
pub use stat::PoolStat;
pub use store::{Store, StoreOptions};
