//! Process configuration loaded from environment variables.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `BILLFLOW_BIND_ADDR` | `0.0.0.0:8080` | HTTP listen address |
//! | `DATABASE_URL` | unset | Postgres URL; unset selects the in-memory store |
//! | `BILLFLOW_DB_MAX_CONNECTIONS` | `5` | Postgres pool size |
//! | `BILLFLOW_OVERDUE_SWEEP_SECS` | `3600` | Sweep interval; `0` disables the sweep |

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub const BIND_ADDR_VAR: &str = "BILLFLOW_BIND_ADDR";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
pub const DB_MAX_CONNECTIONS_VAR: &str = "BILLFLOW_DB_MAX_CONNECTIONS";
pub const OVERDUE_SWEEP_SECS_VAR: &str = "BILLFLOW_OVERDUE_SWEEP_SECS";

const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_OVERDUE_SWEEP_SECS: u64 = 3600;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// `None` when the background sweep is disabled.
    pub overdue_sweep_interval: Option<Duration>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr: SocketAddr = parse_var(BIND_ADDR_VAR, get(BIND_ADDR_VAR))?
            .unwrap_or_else(|| SocketAddr::from(DEFAULT_BIND_ADDR));

        let db_max_connections = parse_var(DB_MAX_CONNECTIONS_VAR, get(DB_MAX_CONNECTIONS_VAR))?
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
        if db_max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: DB_MAX_CONNECTIONS_VAR,
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let sweep_secs: u64 = parse_var(OVERDUE_SWEEP_SECS_VAR, get(OVERDUE_SWEEP_SECS_VAR))?
            .unwrap_or(DEFAULT_OVERDUE_SWEEP_SECS);

        Ok(Self {
            bind_addr,
            database_url: get(DATABASE_URL_VAR),
            db_max_connections,
            overdue_sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
        })
    }
}

fn parse_var<T>(var: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        })
    })
    .transpose()
}
