//! TOML configuration for a pool.
//!
//! ```toml
//! conninfo = "host=localhost dbname=app"
//!
//! [pool]
//! capacity = 10
//! queue_capacity = 128
//! idle_timeout = "60s"
//! connect_timeout = "10s"
//! queue_timeout = "10s"
//! ```
//!
//! Every `[pool]` key is optional and falls back to the [`PoolConfig`] and
//! [`PoolTimeouts`] defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::pool::{PoolConfig, PoolTimeouts};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for `{field}`: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("pool capacity must be greater than zero")]
    ZeroCapacity,

    #[error("conninfo must not be empty")]
    EmptyConninfo,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    conninfo: String,
    #[serde(default)]
    pool: RawPool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPool {
    capacity: Option<usize>,
    queue_capacity: Option<usize>,
    idle_timeout: Option<String>,
    connect_timeout: Option<String>,
    queue_timeout: Option<String>,
}

/// Validated pool settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub conninfo: String,
    pub pool: PoolConfig,
    pub timeouts: PoolTimeouts,
}

impl Settings {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let raw: RawSettings = toml::from_str(s)?;
        if raw.conninfo.trim().is_empty() {
            return Err(ConfigError::EmptyConninfo);
        }

        let pool_defaults = PoolConfig::default();
        let timeout_defaults = PoolTimeouts::default();
        let p = raw.pool;

        let capacity = p.capacity.unwrap_or(pool_defaults.capacity);
        if capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        Ok(Self {
            conninfo: raw.conninfo,
            pool: PoolConfig {
                capacity,
                queue_capacity: p.queue_capacity.unwrap_or(pool_defaults.queue_capacity),
                idle_timeout: duration_field("idle_timeout", p.idle_timeout)?
                    .unwrap_or(pool_defaults.idle_timeout),
            },
            timeouts: PoolTimeouts {
                connect: duration_field("connect_timeout", p.connect_timeout)?
                    .unwrap_or(timeout_defaults.connect),
                queue: duration_field("queue_timeout", p.queue_timeout)?
                    .unwrap_or(timeout_defaults.queue),
            },
        })
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings = Self::from_toml_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(settings)
    }

    pub fn pool_config(&self) -> PoolConfig {
        self.pool.clone()
    }

    pub fn timeouts(&self) -> PoolTimeouts {
        self.timeouts
    }

    /// A libpq connection source for these settings.
    #[cfg(unix)]
    pub fn connection_info(&self) -> crate::source::ConnectionInfo<crate::pg::PgFactory> {
        crate::source::ConnectionInfo::pg(self.conninfo.clone())
    }
}

fn duration_field(field: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|v| parse_duration(&v).ok_or(ConfigError::InvalidDuration { field, value: v }))
        .transpose()
}

/// Parse `"500ms"`, `"5s"`, `"1m"` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
