//! Connection settings and the process-wide handle factory.
//!
//! [`DatabaseConfig`] is loaded from `config/config.toml` (a `[database]`
//! table) layered with `QUARRY__DATABASE__*` environment variables, using
//! `DatabaseConfig::load()`.
//!
//! Descriptors and records that are not given a handle ask the handle factory
//! for one. The default factory loads the configuration and connects;
//! applications and tests replace it with [`set_handle_factory`].

use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock};

use config::{Config, ConfigError, Environment, File};
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::error::{QuarryError, Result};
use crate::handle::Handle;
use crate::transaction::TransactionMode;

const CONFIG_FILE: &str = "config/config.toml";
const ENV_PREFIX: &str = "QUARRY";

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Full connection string; when set, the individual parameters are ignored.
    #[serde(default)]
    pub dsn: Option<String>,
    /// Run handles in autocommit mode.
    #[serde(default)]
    pub autocommit: bool,
    /// `read committed`, `repeatable read`, `serializable`, or a numeric level.
    #[serde(default)]
    pub isolation_level: Option<String>,
}

impl DatabaseConfig {
    /// Load the database configuration from `config/config.toml`, falling back to env vars.
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                // The file exists but is unreadable; retry with the environment alone.
                if std::path::Path::new(CONFIG_FILE).exists() {
                    log::warn!(
                        "failed to load {}, falling back to env: {}",
                        CONFIG_FILE,
                        err
                    );
                }
                Config::builder()
                    .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {}, then env-only error: {}",
                            err, env_err
                        ))
                    })?
            }
        };

        match settings.get::<DatabaseConfig>("database") {
            Ok(db_config) => Ok(db_config),
            Err(ConfigError::NotFound(_)) => Ok(DatabaseConfig::default()),
            Err(e) => Err(ConfigError::Message(format!(
                "Database configuration could not be loaded from file or environment: {}",
                e
            ))),
        }
    }

    /// Key-value connection string built from the individual parameters.
    ///
    /// An explicit `dsn` wins. Empty parameters are left out.
    ///
    /// ```
    /// use quarry::DatabaseConfig;
    ///
    /// let config = DatabaseConfig {
    ///     host: Some("localhost".into()),
    ///     database: Some("app".into()),
    ///     user: Some("app".into()),
    ///     password: Some(String::new()),
    ///     ..Default::default()
    /// };
    /// assert_eq!(config.dsn(), "host=localhost dbname=app user=app");
    /// ```
    pub fn dsn(&self) -> String {
        if let Some(dsn) = self.dsn.as_deref().filter(|d| !d.trim().is_empty()) {
            return dsn.to_string();
        }
        let port = self.port.map(|p| p.to_string());
        let params = [
            ("host", self.host.as_deref()),
            ("port", port.as_deref()),
            ("dbname", self.database.as_deref()),
            ("user", self.user.as_deref()),
            ("password", self.password.as_deref()),
        ];
        let mut dsn = String::new();
        for (key, value) in params {
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                continue;
            };
            if !dsn.is_empty() {
                dsn.push(' ');
            }
            let _ = write!(dsn, "{}={}", key, quote_param(value));
        }
        dsn
    }

    /// Transaction mode for handles built from this configuration.
    pub fn transaction_mode(&self) -> Result<TransactionMode> {
        if self.autocommit {
            return Ok(TransactionMode::Autocommit);
        }
        match self.isolation_level.as_deref() {
            None => Ok(TransactionMode::default()),
            Some(level) => level.parse().map_err(QuarryError::Config),
        }
    }
}

/// Quote a key-value parameter when it contains spaces, quotes or backslashes.
fn quote_param(value: &str) -> String {
    if value
        .chars()
        .any(|c| c.is_whitespace() || c == '\'' || c == '\\')
    {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    } else {
        value.to_string()
    }
}

/// Creates handles for descriptors and records that were not given one.
pub type HandleFactory = Arc<dyn Fn() -> Result<Handle> + Send + Sync>;

static HANDLE_FACTORY: Lazy<RwLock<HandleFactory>> =
    Lazy::new(|| RwLock::new(Arc::new(default_handle)));

fn default_handle() -> Result<Handle> {
    let config = DatabaseConfig::load()?;
    Handle::from_config(&config)
}

/// Replace the process-wide handle factory.
///
/// ```no_run
/// use quarry::{config, Handle};
///
/// config::set_handle_factory(|| Handle::connect("host=localhost dbname=app"));
/// ```
pub fn set_handle_factory<F>(factory: F)
where
    F: Fn() -> Result<Handle> + Send + Sync + 'static,
{
    let mut slot = HANDLE_FACTORY
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    *slot = Arc::new(factory);
}

/// Restore the factory that connects with [`DatabaseConfig::load`].
pub fn reset_handle_factory() {
    set_handle_factory(default_handle);
}

/// The current handle factory.
pub fn handle_factory() -> HandleFactory {
    HANDLE_FACTORY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Create a handle with the current factory.
pub fn new_handle() -> Result<Handle> {
    let factory = handle_factory();
    let handle = factory()?;
    log::debug!("handle factory produced handle {}", handle.id());
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::IsolationLevel;

    #[test]
    fn test_dsn_from_parameters() {
        let config = DatabaseConfig {
            host: Some("db.local".into()),
            port: Some(5433),
            database: Some("quarry_test".into()),
            user: Some("tester".into()),
            password: Some("s3cret".into()),
            ..Default::default()
        };
        assert_eq!(
            config.dsn(),
            "host=db.local port=5433 dbname=quarry_test user=tester password=s3cret"
        );
    }

    #[test]
    fn test_dsn_skips_empty_parameters() {
        let config = DatabaseConfig {
            database: Some("quarry_test".into()),
            user: Some(String::new()),
            password: None,
            ..Default::default()
        };
        assert_eq!(config.dsn(), "dbname=quarry_test");
        assert_eq!(DatabaseConfig::default().dsn(), "");
    }

    #[test]
    fn test_dsn_quotes_awkward_values() {
        let config = DatabaseConfig {
            password: Some("it's a secret".into()),
            ..Default::default()
        };
        assert_eq!(config.dsn(), "password='it\\'s a secret'");
    }

    #[test]
    fn test_explicit_dsn_wins() {
        let config = DatabaseConfig {
            host: Some("ignored".into()),
            dsn: Some("postgresql://u:p@h/db".into()),
            ..Default::default()
        };
        assert_eq!(config.dsn(), "postgresql://u:p@h/db");
    }

    #[test]
    fn test_transaction_mode_from_config() {
        let mut config = DatabaseConfig::default();
        assert_eq!(
            config.transaction_mode().unwrap(),
            TransactionMode::Transactional(IsolationLevel::ReadCommitted)
        );

        config.isolation_level = Some("serializable".into());
        assert_eq!(
            config.transaction_mode().unwrap(),
            TransactionMode::Transactional(IsolationLevel::Serializable)
        );

        config.autocommit = true;
        assert_eq!(
            config.transaction_mode().unwrap(),
            TransactionMode::Autocommit
        );

        config.autocommit = false;
        config.isolation_level = Some("whenever".into());
        assert!(matches!(
            config.transaction_mode(),
            Err(QuarryError::Config(_))
        ));
    }

    #[test]
    fn test_config_deserializes_from_toml() {
        let settings = Config::builder()
            .add_source(config::File::from_str(
                "[database]\nhost = \"localhost\"\nport = 5432\ndatabase = \"app\"\nautocommit = true\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let db: DatabaseConfig = settings.get("database").unwrap();
        assert_eq!(db.host.as_deref(), Some("localhost"));
        assert_eq!(db.port, Some(5432));
        assert!(db.autocommit);
        assert_eq!(db.dsn(), "host=localhost port=5432 dbname=app");
    }
}
