//! Service configuration loaded from environment variables
//!
//! - PORT: listen port (default: 80)
//! - SHUTDOWN_TIMEOUT: drain bound, e.g. "30s", "1m30s", "500ms" (default: 30s)
//! - MONGO_URI: primary store URI (default: mongodb://localhost:27017)
//! - MONGO_DB: primary store database name (default: godemo)
//! - REDIS_ADDR: cache store host:port (default: localhost:6379)
//!
//! Invalid values are logged and replaced by their defaults.

use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PRIMARY_URI: &str = "mongodb://localhost:27017";
pub const DEFAULT_PRIMARY_DATABASE: &str = "godemo";
pub const DEFAULT_CACHE_ADDR: &str = "localhost:6379";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },
}

/// Immutable service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub port: u16,
    pub shutdown_timeout: Duration,
    pub primary_uri: String,
    pub primary_database: String,
    pub cache_addr: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            primary_uri: DEFAULT_PRIMARY_URI.to_string(),
            primary_database: DEFAULT_PRIMARY_DATABASE.to_string(),
            cache_addr: DEFAULT_CACHE_ADDR.to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        // Empty values count as unset
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let port = match get("PORT") {
            Some(raw) => raw.parse::<u16>().unwrap_or_else(|_| {
                warn!(value = %raw, default = DEFAULT_PORT, "Invalid PORT, using default");
                DEFAULT_PORT
            }),
            None => defaults.port,
        };

        let shutdown_timeout = match get("SHUTDOWN_TIMEOUT") {
            Some(raw) => parse_duration(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Invalid SHUTDOWN_TIMEOUT, using default");
                DEFAULT_SHUTDOWN_TIMEOUT
            }),
            None => defaults.shutdown_timeout,
        };

        Self {
            port,
            shutdown_timeout,
            primary_uri: get("MONGO_URI").unwrap_or(defaults.primary_uri),
            primary_database: get("MONGO_DB").unwrap_or(defaults.primary_database),
            cache_addr: get("REDIS_ADDR").unwrap_or(defaults.cache_addr),
        }
    }
}

/// Parse a duration string such as "300ms", "1.5h" or "2h45m"
///
/// Accepts a sequence of decimal numbers each followed by a unit
/// (ns, us, µs, ms, s, m, h). A bare "0" is zero.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let s = input.trim();

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err(invalid()),
            other => {
                return Err(ConfigError::UnknownUnit {
                    unit: other.to_string(),
                    input: input.to_string(),
                })
            }
        };
        total_nanos += value * scale;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
