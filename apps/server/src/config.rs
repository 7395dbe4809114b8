//! Server configuration read from the environment at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use dairysync_core::sync::{ConflictStrategy, SyncEngineConfig, DEFAULT_MAX_DELIVERY_ATTEMPTS};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8088";
pub const DEFAULT_DB_PATH: &str = "./data";
pub const DEFAULT_CENTER_ID: &str = "default";
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_CACHE_TTL_SECS: i64 = 3600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Data directory; the database file lives inside it.
    pub db_path: PathBuf,
    pub remote_url: String,
    pub center_id: String,
    pub sync_interval: Duration,
    pub probe_interval: Duration,
    pub engine: SyncEngineConfig,
    /// Zero keeps cached gateway responses until replaced.
    pub cache_ttl_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let raw_addr =
            read("DAIRYSYNC_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = raw_addr
            .parse::<SocketAddr>()
            .map_err(|err| ConfigError::Invalid {
                name: "DAIRYSYNC_LISTEN_ADDR",
                reason: err.to_string(),
                value: raw_addr.clone(),
            })?;
        let remote_url = read("DAIRYSYNC_REMOTE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or(ConfigError::Missing("DAIRYSYNC_REMOTE_URL"))?;
        if !remote_url.starts_with("http://") && !remote_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                name: "DAIRYSYNC_REMOTE_URL",
                value: remote_url,
                reason: "expected an http(s) URL".to_string(),
            });
        }

        let sync_interval_secs: u64 = parse_or(
            "DAIRYSYNC_SYNC_INTERVAL_SECS",
            read("DAIRYSYNC_SYNC_INTERVAL_SECS"),
            DEFAULT_SYNC_INTERVAL_SECS,
        )?;
        let probe_interval_secs: u64 = parse_or(
            "DAIRYSYNC_PROBE_INTERVAL_SECS",
            read("DAIRYSYNC_PROBE_INTERVAL_SECS"),
            DEFAULT_PROBE_INTERVAL_SECS,
        )?;
        for (name, secs) in [
            ("DAIRYSYNC_SYNC_INTERVAL_SECS", sync_interval_secs),
            ("DAIRYSYNC_PROBE_INTERVAL_SECS", probe_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    value: secs.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        let conflict_strategy = match read("DAIRYSYNC_CONFLICT_STRATEGY") {
            Some(value) => value
                .parse::<ConflictStrategy>()
                .map_err(|err| ConfigError::Invalid {
                    name: "DAIRYSYNC_CONFLICT_STRATEGY",
                    value,
                    reason: err.to_string(),
                })?,
            None => ConflictStrategy::default(),
        };
        let max_delivery_attempts: i32 = parse_or(
            "DAIRYSYNC_MAX_DELIVERY_ATTEMPTS",
            read("DAIRYSYNC_MAX_DELIVERY_ATTEMPTS"),
            DEFAULT_MAX_DELIVERY_ATTEMPTS,
        )?;
        if max_delivery_attempts < 0 {
            return Err(ConfigError::Invalid {
                name: "DAIRYSYNC_MAX_DELIVERY_ATTEMPTS",
                value: max_delivery_attempts.to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        let cache_ttl_secs: i64 = parse_or(
            "DAIRYSYNC_CACHE_TTL_SECS",
            read("DAIRYSYNC_CACHE_TTL_SECS"),
            DEFAULT_CACHE_TTL_SECS,
        )?;

        Ok(Self {
            listen_addr,
            db_path: PathBuf::from(
                read("DAIRYSYNC_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            ),
            remote_url,
            center_id: read("DAIRYSYNC_CENTER_ID").unwrap_or_else(|| DEFAULT_CENTER_ID.to_string()),
            sync_interval: Duration::from_secs(sync_interval_secs),
            probe_interval: Duration::from_secs(probe_interval_secs),
            engine: SyncEngineConfig {
                conflict_strategy,
                max_delivery_attempts,
            },
            cache_ttl_secs,
        })
    }

    pub fn cache_ttl(&self) -> Option<i64> {
        (self.cache_ttl_secs > 0).then_some(self.cache_ttl_secs)
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.parse::<T>().map_err(|err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
            value,
        }),
        None => Ok(default),
    }
}
