//! Run configuration.
//!
//! Everything has an environment default; command-line flags override it in
//! `main`. Values that cannot be used are rejected here with a
//! [`ConfigError`] before any connection is opened.

use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::insert::{DEFAULT_BATCH_SIZE, InsertMethod, UnknownInsertMethod};
use crate::models::{NameType, UnknownNameType};

pub const DEFAULT_TIMEOUT_MS: i64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DB_ADDR must be set when DATABASE_URL is not")]
    MissingAddress,
    #[error("invalid DB_ADDR '{0}' (expected host or host:port)")]
    InvalidAddress(String),
    #[error("invalid DB_SSLMODE '{0}'")]
    InvalidSslMode(String),
    #[error("invalid DATABASE_URL: {0}")]
    InvalidUrl(#[source] sqlx::Error),
    #[error("batch size must be positive, got {0}")]
    InvalidBatchSize(i64),
    #[error(transparent)]
    NameType(#[from] UnknownNameType),
    #[error(transparent)]
    Method(#[from] UnknownInsertMethod),
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_string_or(key: &str, default: &str) -> String {
    env_string(key).unwrap_or_else(|| default.to_string())
}

/// Connection settings. `DATABASE_URL` wins over the split variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbConfig {
    pub url: Option<String>,
    pub addr: Option<String>,
    pub user: String,
    pub password: Option<String>,
    pub name: String,
    pub sslmode: Option<String>,
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_string("DATABASE_URL"),
            addr: env_string("DB_ADDR"),
            user: env_string_or("DB_USER", "postgres"),
            password: env::var("DB_PASSWORD").ok(),
            name: env_string_or("DB_NAME", "postgres"),
            sslmode: env_string("DB_SSLMODE"),
        }
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        let options = match &self.url {
            Some(url) => url
                .parse::<PgConnectOptions>()
                .map_err(ConfigError::InvalidUrl)?,
            None => {
                let addr = self.addr.as_deref().ok_or(ConfigError::MissingAddress)?;
                let (host, port) = split_addr(addr)?;
                let mut options = PgConnectOptions::new()
                    .host(host)
                    .username(&self.user)
                    .database(&self.name);
                if let Some(port) = port {
                    options = options.port(port);
                }
                if let Some(password) = &self.password {
                    options = options.password(password);
                }
                options
            }
        };

        let options = match &self.sslmode {
            Some(mode) => options.ssl_mode(
                mode.parse::<PgSslMode>()
                    .map_err(|_| ConfigError::InvalidSslMode(mode.clone()))?,
            ),
            None => options,
        };

        Ok(options.log_statements(LevelFilter::Trace))
    }
}

/// Split `host[:port]`; IPv6 hosts must be bracketed when a port is given.
fn split_addr(addr: &str) -> Result<(&str, Option<u16>), ConfigError> {
    let invalid = || ConfigError::InvalidAddress(addr.to_string());

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        return match tail {
            "" => Ok((host, None)),
            _ => {
                let port = tail.strip_prefix(':').ok_or_else(invalid)?;
                Ok((host, Some(port.parse().map_err(|_| invalid())?)))
            }
        };
    }

    match addr.split_once(':') {
        None if !addr.is_empty() => Ok((addr, None)),
        Some((host, port)) if !host.is_empty() && !port.contains(':') => {
            Ok((host, Some(port.parse().map_err(|_| invalid())?)))
        }
        _ => Err(invalid()),
    }
}

/// Validate a requested batch size.
pub fn batch_size(requested: i64) -> Result<NonZeroUsize, ConfigError> {
    usize::try_from(requested)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or(ConfigError::InvalidBatchSize(requested))
}

/// Milliseconds to an optional run timeout; zero or negative disables it.
pub fn timeout(millis: i64) -> Option<Duration> {
    u64::try_from(millis)
        .ok()
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadConfig {
    /// `None` reads standard input.
    pub input: Option<PathBuf>,
    pub name_type: NameType,
    pub method: InsertMethod,
    pub batch_size: NonZeroUsize,
    pub pipeline: bool,
    pub timeout: Option<Duration>,
    pub truncate: bool,
    pub infer_gender: bool,
    pub keep_sparse: bool,
}

impl LoadConfig {
    /// Defaults with `INPUT_FILE` and `NAME_TYPE` applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let name_type = match env_string("NAME_TYPE") {
            Some(value) => value.parse()?,
            None => NameType::Surname,
        };

        Ok(Self {
            input: env_string("INPUT_FILE").map(PathBuf::from),
            name_type,
            ..Self::default()
        })
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            input: None,
            name_type: NameType::Surname,
            method: InsertMethod::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            pipeline: false,
            timeout: timeout(DEFAULT_TIMEOUT_MS),
            truncate: false,
            infer_gender: false,
            keep_sparse: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// env_logger filter directives, e.g. `info` or `fillnames=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl LogConfig {
    pub fn from_env() -> Self {
        let format = match env_string("LOG_FORMAT").map(|f| f.to_ascii_lowercase()) {
            Some(f) if f == "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        };
        Self {
            level: env_string_or("LOG_LEVEL", "info"),
            format,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_must_be_positive() {
        assert_eq!(batch_size(1000).unwrap().get(), 1000);
        assert!(matches!(batch_size(0), Err(ConfigError::InvalidBatchSize(0))));
        assert!(matches!(batch_size(-3), Err(ConfigError::InvalidBatchSize(-3))));
    }

    #[test]
    fn non_positive_timeout_disables_it() {
        assert_eq!(timeout(60_000), Some(Duration::from_secs(60)));
        assert_eq!(timeout(0), None);
        assert_eq!(timeout(-1), None);
    }

    #[test]
    fn splits_addresses() {
        assert_eq!(split_addr("db:5433").unwrap(), ("db", Some(5433)));
        assert_eq!(split_addr("db").unwrap(), ("db", None));
        assert_eq!(split_addr("[::1]:5432").unwrap(), ("::1", Some(5432)));
        assert_eq!(split_addr("[::1]").unwrap(), ("::1", None));
        assert!(split_addr("db:port").is_err());
        assert!(split_addr(":5432").is_err());
        assert!(split_addr("").is_err());
    }

    #[test]
    fn split_settings_build_options() {
        let config = DbConfig {
            addr: Some("db.internal:6543".into()),
            user: "loader".into(),
            password: Some("secret".into()),
            name: "names".into(),
            sslmode: Some("disable".into()),
            ..DbConfig::default()
        };
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_username(), "loader");
        assert_eq!(options.get_database(), Some("names"));
    }

    #[test]
    fn url_wins_over_split_settings() {
        let config = DbConfig {
            url: Some("postgres://app@urlhost:5439/appdb".into()),
            addr: Some("ignored:1".into()),
            ..DbConfig::default()
        };
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_host(), "urlhost");
        assert_eq!(options.get_port(), 5439);
    }

    #[test]
    fn missing_address_and_bad_sslmode_are_rejected() {
        assert!(matches!(
            DbConfig::default().connect_options(),
            Err(ConfigError::MissingAddress)
        ));

        let config = DbConfig {
            addr: Some("db".into()),
            sslmode: Some("sometimes".into()),
            ..DbConfig::default()
        };
        assert!(matches!(
            config.connect_options(),
            Err(ConfigError::InvalidSslMode(_))
        ));
    }

    #[test]
    fn defaults_match_cli_defaults() {
        let config = LoadConfig::default();
        assert_eq!(config.batch_size.get(), 1000);
        assert_eq!(config.timeout, Some(Duration::from_millis(60_000)));
        assert_eq!(config.method, InsertMethod::CopyFrom);
        assert_eq!(config.name_type, NameType::Surname);
    }
}
