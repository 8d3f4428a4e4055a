//! Connection settings and pool configuration.
//!
//! [`AuroraConfig`] assembles the DSNs for the read-write and read-only
//! endpoints. [`PoolConfig`]
//! carries everything a single [`crate::pool::ResilientPool`] needs and is
//! immutable once built — any zero-valued duration or count handed to a
//! builder method is replaced by its documented default right away.

use crate::error::{Error, Result};
use crate::metrics::MetricsEmitter;
use crate::probe::Probe;
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgConnectOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 50;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 20;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_VALIDATION_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_POOL_HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MIN_AVAILABLE_CONNECTION_FAIL_SIZE: usize = 3;
pub const DEFAULT_VALIDATION_COUNT_DESTROY_TRIGGER: usize = 2;

/// What to do when a read-only operation is asked for but no RO pool exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadFallback {
    /// Fall back to the RW pool and log a warning (the default).
    #[default]
    Warn,
    /// Refuse the operation instead of silently reading from RW.
    Disabled,
}

/// TLS material required when connecting with `sslmode=verify-ca`.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub ca_bundle_path: PathBuf,
}

/// Connection parameters for an Aurora primary/replica pair.
///
/// Validated once, at construction; refuses to build on missing required
/// fields.
#[derive(Debug, Clone)]
pub struct AuroraConfig {
    pub user: String,
    pub password: SecretString,
    pub host: String,
    pub ro_host: Option<String>,
    pub port: u16,
    pub database: String,
    pub tls: Option<TlsConfig>,
}

impl AuroraConfig {
    /// # Errors
    /// Returns [`Error::Config`] if any required field is empty.
    pub fn new(
        user: impl Into<String>,
        password: SecretString,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
    ) -> Result<Self> {
        let cfg = Self {
            user: user.into(),
            password,
            host: host.into(),
            ro_host: None,
            port,
            database: database.into(),
            tls: None,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[must_use]
    pub fn with_ro_host(mut self, ro_host: impl Into<String>) -> Self {
        self.ro_host = Some(ro_host.into());
        self
    }

    #[must_use]
    pub fn with_tls(mut self, ca_bundle_path: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsConfig {
            ca_bundle_path: ca_bundle_path.into(),
        });
        self
    }

    fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(Error::Config("user cannot be empty".to_string()));
        }
        if self.password.expose_secret().is_empty() {
            return Err(Error::Config("password cannot be empty".to_string()));
        }
        if self.host.is_empty() {
            return Err(Error::Config("host cannot be empty".to_string()));
        }
        if self.database.is_empty() {
            return Err(Error::Config("database cannot be empty".to_string()));
        }
        Ok(())
    }

    fn dsn_for(&self, host: &str) -> String {
        match &self.tls {
            Some(tls) => format!(
                "postgres://{}:{}@{}:{}/{}?sslmode=verify-ca&sslrootcert={}",
                self.user,
                self.password.expose_secret(),
                host,
                self.port,
                self.database,
                tls.ca_bundle_path.display(),
            ),
            None => format!(
                "postgres://{}:{}@{}:{}/{}?sslmode=disable",
                self.user,
                self.password.expose_secret(),
                host,
                self.port,
                self.database,
            ),
        }
    }

    /// DSN for the read-write (primary) endpoint.
    #[must_use]
    pub fn rw_dsn(&self) -> String {
        self.dsn_for(&self.host)
    }

    /// DSN for the read-only (replica) endpoint. Falls back to the RW host
    /// when no replica host was configured.
    #[must_use]
    pub fn ro_dsn(&self) -> String {
        match &self.ro_host {
            Some(host) => self.dsn_for(host),
            None => self.dsn_for(&self.host),
        }
    }

    /// Parsed `sqlx` connect options for the read-write endpoint.
    ///
    /// # Errors
    /// Returns [`Error::Database`] if the assembled DSN cannot be parsed.
    pub fn rw_connect_options(&self) -> Result<PgConnectOptions> {
        Ok(PgConnectOptions::from_str(&self.rw_dsn())?)
    }

    /// Parsed `sqlx` connect options for the read-only endpoint.
    ///
    /// # Errors
    /// Returns [`Error::Database`] if the assembled DSN cannot be parsed.
    pub fn ro_connect_options(&self) -> Result<PgConnectOptions> {
        Ok(PgConnectOptions::from_str(&self.ro_dsn())?)
    }
}

/// Everything one [`crate::pool::ResilientPool`] needs.
#[derive(Clone)]
pub struct PoolConfig {
    pub(crate) host: String,
    pub(crate) connect_options: PgConnectOptions,
    pub(crate) max_connections: u32,
    pub(crate) min_connections: u32,
    pub(crate) probe: Option<Arc<dyn Probe>>,
    pub(crate) probe_timeout: Duration,
    pub(crate) validation_period: Duration,
    pub(crate) pool_health_check_period: Duration,
    pub(crate) min_available_connection_fail_size: usize,
    pub(crate) validation_count_destroy_trigger: usize,
    pub(crate) metrics_emitter: Option<Arc<dyn MetricsEmitter>>,
}

impl PoolConfig {
    /// `host` is used purely for logging/metric tags (`pg_host`), it is not
    /// re-derived from `connect_options` since a connect string may resolve
    /// through a proxy or DNS alias that differs from the tag we want.
    #[must_use]
    pub fn new(host: impl Into<String>, connect_options: PgConnectOptions) -> Self {
        Self {
            host: host.into(),
            connect_options,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            probe: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            validation_period: DEFAULT_VALIDATION_PERIOD,
            pool_health_check_period: DEFAULT_POOL_HEALTH_CHECK_PERIOD,
            min_available_connection_fail_size: DEFAULT_MIN_AVAILABLE_CONNECTION_FAIL_SIZE,
            validation_count_destroy_trigger: DEFAULT_VALIDATION_COUNT_DESTROY_TRIGGER,
            metrics_emitter: None,
        }
    }

    #[must_use]
    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = if n == 0 { DEFAULT_MAX_CONNECTIONS } else { n };
        self
    }

    #[must_use]
    pub fn with_min_connections(mut self, n: u32) -> Self {
        self.min_connections = if n == 0 { DEFAULT_MIN_CONNECTIONS } else { n };
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, d: Duration) -> Self {
        self.probe_timeout = if d.is_zero() { DEFAULT_PROBE_TIMEOUT } else { d };
        self
    }

    #[must_use]
    pub fn with_validation_period(mut self, d: Duration) -> Self {
        self.validation_period = if d.is_zero() {
            DEFAULT_VALIDATION_PERIOD
        } else {
            d
        };
        self
    }

    #[must_use]
    pub fn with_pool_health_check_period(mut self, d: Duration) -> Self {
        self.pool_health_check_period = if d.is_zero() {
            DEFAULT_POOL_HEALTH_CHECK_PERIOD
        } else {
            d
        };
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, min_available_fail_size: usize, destroy_trigger: usize) -> Self {
        self.min_available_connection_fail_size = if min_available_fail_size == 0 {
            DEFAULT_MIN_AVAILABLE_CONNECTION_FAIL_SIZE
        } else {
            min_available_fail_size
        };
        self.validation_count_destroy_trigger = if destroy_trigger == 0 {
            DEFAULT_VALIDATION_COUNT_DESTROY_TRIGGER
        } else {
            destroy_trigger
        };
        self
    }

    #[must_use]
    pub fn with_metrics_emitter(mut self, emitter: Arc<dyn MetricsEmitter>) -> Self {
        self.metrics_emitter = Some(emitter);
        self
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn rejects_empty_user() {
        let err = AuroraConfig::new("", secret("pw"), "host", 5432, "db").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_empty_password() {
        let err = AuroraConfig::new("user", secret(""), "host", 5432, "db").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn dsn_without_tls() {
        let cfg = AuroraConfig::new("user", secret("pw"), "primary.example", 5432, "db").unwrap();
        assert_eq!(
            cfg.rw_dsn(),
            "postgres://user:pw@primary.example:5432/db?sslmode=disable"
        );
    }

    #[test]
    fn dsn_with_tls() {
        let cfg = AuroraConfig::new("user", secret("pw"), "primary.example", 5432, "db")
            .unwrap()
            .with_tls("/config/ca_certs/bundle");
        assert_eq!(
            cfg.rw_dsn(),
            "postgres://user:pw@primary.example:5432/db?sslmode=verify-ca&sslrootcert=/config/ca_certs/bundle"
        );
    }

    #[test]
    fn ro_dsn_falls_back_to_rw_host_when_absent() {
        let cfg = AuroraConfig::new("user", secret("pw"), "primary.example", 5432, "db").unwrap();
        assert_eq!(cfg.ro_dsn(), cfg.rw_dsn());
    }

    #[test]
    fn ro_dsn_uses_replica_host_when_present() {
        let cfg = AuroraConfig::new("user", secret("pw"), "primary.example", 5432, "db")
            .unwrap()
            .with_ro_host("replica.example");
        assert!(cfg.ro_dsn().contains("replica.example"));
        assert!(!cfg.ro_dsn().contains("primary.example"));
    }

    #[test]
    fn zero_valued_fields_fall_back_to_defaults() {
        let opts = PgConnectOptions::new();
        let pool_cfg = PoolConfig::new("primary", opts)
            .with_max_connections(0)
            .with_min_connections(0)
            .with_probe_timeout(Duration::ZERO)
            .with_validation_period(Duration::ZERO)
            .with_thresholds(0, 0);

        assert_eq!(pool_cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(pool_cfg.min_connections, DEFAULT_MIN_CONNECTIONS);
        assert_eq!(pool_cfg.probe_timeout, DEFAULT_PROBE_TIMEOUT);
        assert_eq!(pool_cfg.validation_period, DEFAULT_VALIDATION_PERIOD);
        assert_eq!(
            pool_cfg.min_available_connection_fail_size,
            DEFAULT_MIN_AVAILABLE_CONNECTION_FAIL_SIZE
        );
        assert_eq!(
            pool_cfg.validation_count_destroy_trigger,
            DEFAULT_VALIDATION_COUNT_DESTROY_TRIGGER
        );
    }

    #[test]
    fn explicit_nonzero_values_are_kept() {
        let opts = PgConnectOptions::new();
        let pool_cfg = PoolConfig::new("primary", opts)
            .with_max_connections(3)
            .with_thresholds(1, 1);

        assert_eq!(pool_cfg.max_connections, 3);
        assert_eq!(pool_cfg.min_available_connection_fail_size, 1);
        assert_eq!(pool_cfg.validation_count_destroy_trigger, 1);
    }
}
