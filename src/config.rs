//! Configuration management for the Warehouse server

use std::env;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Limits and retention for the sync endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Rows per entity type when the client omits `limit`
    pub default_delta_limit: u32,
    /// Largest `limit` a client may request
    pub max_delta_limit: u32,
    /// Batches longer than this are rejected outright
    pub max_batch_operations: usize,
    /// Wall-clock budget for one batch
    pub batch_timeout_secs: u64,
    /// Tombstones older than this are swept
    pub tombstone_retention_days: i64,
    /// Sweep period; 0 disables the background sweep
    pub tombstone_sweep_interval_secs: u64,
}

/// Longest tombstone retention or cleanup age, in days
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{key} must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./warehouse.db".to_string(),
                max_connections: 5,
            },
            sync: SyncConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            default_delta_limit: 500,
            max_delta_limit: 1000,
            max_batch_operations: 500,
            batch_timeout_secs: 30,
            tombstone_retention_days: 30,
            tombstone_sweep_interval_secs: 3600,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_var(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            sync: SyncConfig {
                default_delta_limit: parse_var(
                    "SYNC_DEFAULT_DELTA_LIMIT",
                    defaults.sync.default_delta_limit,
                )?,
                max_delta_limit: parse_var("SYNC_MAX_DELTA_LIMIT", defaults.sync.max_delta_limit)?,
                max_batch_operations: parse_var(
                    "SYNC_MAX_BATCH_OPERATIONS",
                    defaults.sync.max_batch_operations,
                )?,
                batch_timeout_secs: parse_var(
                    "SYNC_BATCH_TIMEOUT_SECS",
                    defaults.sync.batch_timeout_secs,
                )?,
                tombstone_retention_days: in_range(
                    "TOMBSTONE_RETENTION_DAYS",
                    parse_var(
                        "TOMBSTONE_RETENTION_DAYS",
                        defaults.sync.tombstone_retention_days,
                    )?,
                    0,
                    MAX_RETENTION_DAYS,
                )?,
                tombstone_sweep_interval_secs: parse_var(
                    "TOMBSTONE_SWEEP_INTERVAL_SECS",
                    defaults.sync.tombstone_sweep_interval_secs,
                )?,
            },
        })
    }
}

/// Read an optional env var, falling back to `default` when unset
fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

fn in_range(key: &'static str, value: i64, min: i64, max: i64) -> Result<i64, ConfigError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.sync.default_delta_limit, 500);
        assert_eq!(config.sync.max_delta_limit, 1000);
        assert_eq!(config.sync.tombstone_retention_days, 30);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("WAREHOUSE_TEST_PORT_GARBAGE", "not-a-port");
        let err = parse_var::<u16>("WAREHOUSE_TEST_PORT_GARBAGE", 1).unwrap_err();
        assert!(err.to_string().contains("WAREHOUSE_TEST_PORT_GARBAGE"));
        env::remove_var("WAREHOUSE_TEST_PORT_GARBAGE");
    }

    #[test]
    fn test_retention_days_must_be_in_range() {
        assert_eq!(in_range("TOMBSTONE_RETENTION_DAYS", 30, 0, MAX_RETENTION_DAYS).unwrap(), 30);

        let err = in_range("TOMBSTONE_RETENTION_DAYS", 1_000_000_000, 0, MAX_RETENTION_DAYS)
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
        assert!(err.to_string().contains("TOMBSTONE_RETENTION_DAYS"));
        assert!(in_range("TOMBSTONE_RETENTION_DAYS", -1, 0, MAX_RETENTION_DAYS).is_err());
    }

    #[test]
    fn test_parse_var_default_when_unset() {
        let value = parse_var::<u32>("WAREHOUSE_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
