//! Connection and pool settings
//!
//! [`ConnectionParams`] is the raw, unvalidated input to [`crate::resolve`].
//! [`PoolConfig`] bounds the pool. Both can be built by hand, deserialized
//! with serde, or loaded from the environment via [`Settings::from_env`].

mod connection_string;

use crate::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default Postgres port, as a string since ports arrive unparsed
pub const DEFAULT_PORT: &str = "5432";

/// Root certificate path used when `DB_ROOT_CERT` is not set
pub const DEFAULT_ROOT_CERT_PATH: &str = "config/root.crt";

/// Where the TLS root certificate comes from
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertSource {
    /// PEM file on disk
    Path(PathBuf),
    /// PEM bytes held in memory
    Pem(Vec<u8>),
    /// Platform trust store
    System,
}

impl fmt::Debug for CertSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            CertSource::Pem(bytes) => write!(f, "Pem(<{} bytes>)", bytes.len()),
            CertSource::System => f.write_str("System"),
        }
    }
}

impl Default for CertSource {
    fn default() -> Self {
        CertSource::Path(PathBuf::from(DEFAULT_ROOT_CERT_PATH))
    }
}

/// Raw connection parameters, as supplied by the configuration loader
///
/// Nothing here is validated; [`crate::resolve`] does that once.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Hostname or IPv4 literal
    pub host: String,
    /// Port, unparsed
    pub port: String,
    /// Database name
    pub database: String,
    /// Username
    pub user: String,
    /// Password (never logged)
    pub password: Option<String>,
    /// TLS root certificate
    pub root_cert: CertSource,
    /// Bound on TCP connect + TLS handshake + authentication
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// `application_name` startup parameter
    pub application_name: Option<String>,
    /// Server-side `statement_timeout` startup parameter
    #[serde(with = "opt_duration_secs")]
    pub statement_timeout: Option<Duration>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT.to_string(),
            database: "yugabyte".to_string(),
            user: whoami::username(),
            password: None,
            root_cert: CertSource::default(),
            connect_timeout: PoolConfig::DEFAULT_CONNECT_TIMEOUT,
            application_name: None,
            statement_timeout: None,
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("root_cert", &self.root_cert)
            .field("connect_timeout", &self.connect_timeout)
            .field("application_name", &self.application_name)
            .field("statement_timeout", &self.statement_timeout)
            .finish()
    }
}

impl ConnectionParams {
    /// Create params for a host, database and user with other fields defaulted
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    /// Set port (validated at resolution time)
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    /// Set password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set root certificate source
    pub fn root_cert(mut self, source: CertSource) -> Self {
        self.root_cert = source;
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set application name
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set server-side statement timeout
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }
}

/// Pool sizing and lifecycle settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum connections, idle and checked out together
    pub max_size: usize,
    /// Connections kept open even when idle
    pub min_size: usize,
    /// Connections older than this are retired
    #[serde(with = "duration_secs")]
    pub max_lifetime: Duration,
    /// Idle connections older than this are retired
    #[serde(with = "duration_secs")]
    pub max_idle_time: Duration,
    /// Period of the background maintenance pass
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,
    /// Bound on creating one connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Default grace period used by [`crate::Pool::close`]
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: Self::DEFAULT_MAX_SIZE,
            min_size: Self::DEFAULT_MIN_SIZE,
            max_lifetime: Duration::from_secs(60 * 60),
            max_idle_time: Duration::from_secs(30 * 60),
            health_check_interval: Duration::from_secs(60),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Default maximum pool size
    pub const DEFAULT_MAX_SIZE: usize = 25;
    /// Default minimum pool size
    pub const DEFAULT_MIN_SIZE: usize = 5;
    /// Default connect timeout
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum size
    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    /// Set minimum size
    pub fn min_size(mut self, n: usize) -> Self {
        self.min_size = n;
        self
    }

    /// Set maximum connection lifetime
    pub fn max_lifetime(mut self, d: Duration) -> Self {
        self.max_lifetime = d;
        self
    }

    /// Set maximum idle time
    pub fn max_idle_time(mut self, d: Duration) -> Self {
        self.max_idle_time = d;
        self
    }

    /// Set maintenance interval
    pub fn health_check_interval(mut self, d: Duration) -> Self {
        self.health_check_interval = d;
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    /// Set shutdown grace period
    pub fn shutdown_grace(mut self, d: Duration) -> Self {
        self.shutdown_grace = d;
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(Error::Config(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::Config(
                "health_check_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to stand up a pool
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Connection parameters
    pub connection: ConnectionParams,
    /// Pool settings
    pub pool: PoolConfig,
}

impl Settings {
    /// Load from `DB_*` environment variables
    ///
    /// | Variable | Meaning | Default |
    /// |---|---|---|
    /// | `DB_HOST` | host | `localhost` |
    /// | `DB_PORT` | port | `5432` |
    /// | `DB_NAME` | database | `yugabyte` |
    /// | `DB_USER` | user | current OS user |
    /// | `DB_PASSWORD` | password | none |
    /// | `DB_ROOT_CERT` | root cert path, or `system` | `config/root.crt` |
    /// | `DB_POOL_MAX` | max pool size | 25 |
    /// | `DB_POOL_MIN` | min pool size | 5 |
    /// | `DB_CONNECT_TIMEOUT_SECS` | connect timeout | 10 |
    /// | `DB_APPLICATION_NAME` | application name | none |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        let conn = &mut settings.connection;

        if let Some(host) = lookup("DB_HOST") {
            conn.host = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            conn.port = port;
        }
        if let Some(db) = lookup("DB_NAME") {
            conn.database = db;
        }
        if let Some(user) = lookup("DB_USER") {
            conn.user = user;
        }
        conn.password = lookup("DB_PASSWORD");
        conn.application_name = lookup("DB_APPLICATION_NAME");
        if let Some(cert) = lookup("DB_ROOT_CERT") {
            conn.root_cert = if cert.eq_ignore_ascii_case("system") {
                CertSource::System
            } else {
                CertSource::Path(PathBuf::from(cert))
            };
        }

        let pool = &mut settings.pool;
        if let Some(v) = lookup("DB_POOL_MAX") {
            pool.max_size = parse_number("DB_POOL_MAX", &v)?;
        }
        if let Some(v) = lookup("DB_POOL_MIN") {
            pool.min_size = parse_number("DB_POOL_MIN", &v)?;
        }
        if let Some(v) = lookup("DB_CONNECT_TIMEOUT_SECS") {
            let secs = parse_number::<u64>("DB_CONNECT_TIMEOUT_SECS", &v)?;
            pool.connect_timeout = Duration::from_secs(secs);
            settings.connection.connect_timeout = pool.connect_timeout;
        }

        settings.pool.validate()?;
        Ok(settings)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|o| o.map(Duration::from_secs))
    }
}
