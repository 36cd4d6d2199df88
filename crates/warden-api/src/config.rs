//! # Service Configuration
//!
//! Environment variables are read once at startup into [`AppConfig`].
//! Unset variables take their defaults; a set but unparseable variable is
//! a startup error rather than a silent fallback.
//!
//! | Variable | Default |
//! |---|---|
//! | `PORT` | `8080` |
//! | `DATABASE_URL` | unset (in-memory only) |
//! | `WARDEN_POLICY_FILE` | unset |
//! | `WARDEN_WORKER_TICK_MS` | `1000` |
//! | `WARDEN_MAX_RETRIES` | `3` (at most 20) |
//! | `WARDEN_RETRY_BASE_SECS` | `30` (at most 86400) |
//! | `WARDEN_BUSINESS_HOURS` | `08-18` |
//! | `WARDEN_QUEUE_CAPACITY` | `100000` |
//! | `WARDEN_RECENT_WINDOW_HOURS` | `24` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use warden_engine::config::{MAX_RETRIES, MAX_RETRY_BASE_SECS};
use warden_engine::{BusinessHours, EngineConfig};

/// A configuration variable that is set but invalid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The value could not be parsed.
    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Application configuration.
///
/// Custom `Debug` redacts the database URL, which usually embeds a password.
#[derive(Clone)]
pub struct AppConfig {
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Postgres connection string. `None` runs in-memory only.
    pub database_url: Option<String>,
    /// YAML file of policies loaded at startup.
    pub policy_file: Option<PathBuf>,
    /// Interval between deferred-execution worker runs.
    pub worker_tick: Duration,
    /// Engine settings.
    pub engine: EngineConfig,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("port", &self.port)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("policy_file", &self.policy_file)
            .field("worker_tick", &self.worker_tick)
            .field("engine", &self.engine)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: None,
            policy_file: None,
            worker_tick: Duration::from_millis(1000),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`, which returns the raw value
    /// of a variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let engine_defaults = defaults.engine;

        let port = parse_var(&lookup, "PORT")?.unwrap_or(defaults.port);
        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        let policy_file = lookup("WARDEN_POLICY_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let tick_ms: u64 = parse_var(&lookup, "WARDEN_WORKER_TICK_MS")?.unwrap_or(1000);
        if tick_ms == 0 {
            return Err(invalid("WARDEN_WORKER_TICK_MS", "0", "must be positive"));
        }

        let max_retries =
            parse_var(&lookup, "WARDEN_MAX_RETRIES")?.unwrap_or(engine_defaults.max_retries);
        if max_retries > MAX_RETRIES {
            return Err(invalid(
                "WARDEN_MAX_RETRIES",
                &max_retries.to_string(),
                &format!("must be at most {MAX_RETRIES}"),
            ));
        }
        let retry_base_delay = match parse_var::<i64, _>(&lookup, "WARDEN_RETRY_BASE_SECS")? {
            Some(secs) if !(0..=MAX_RETRY_BASE_SECS).contains(&secs) => {
                return Err(invalid(
                    "WARDEN_RETRY_BASE_SECS",
                    &secs.to_string(),
                    &format!("must be between 0 and {MAX_RETRY_BASE_SECS}"),
                ))
            }
            Some(secs) => chrono::Duration::seconds(secs),
            None => engine_defaults.retry_base_delay,
        };
        let business_hours: BusinessHours = parse_var(&lookup, "WARDEN_BUSINESS_HOURS")?
            .unwrap_or(engine_defaults.business_hours);
        let queue_capacity: usize = parse_var(&lookup, "WARDEN_QUEUE_CAPACITY")?
            .unwrap_or(engine_defaults.queue_capacity);
        if queue_capacity == 0 {
            return Err(invalid("WARDEN_QUEUE_CAPACITY", "0", "must be positive"));
        }
        let recent_window = match parse_var::<i64, _>(&lookup, "WARDEN_RECENT_WINDOW_HOURS")? {
            Some(hours) if hours <= 0 => {
                return Err(invalid(
                    "WARDEN_RECENT_WINDOW_HOURS",
                    &hours.to_string(),
                    "must be positive",
                ))
            }
            Some(hours) => chrono::Duration::try_hours(hours).ok_or_else(|| {
                invalid("WARDEN_RECENT_WINDOW_HOURS", &hours.to_string(), "out of range")
            })?,
            None => engine_defaults.recent_window,
        };

        Ok(Self {
            port,
            database_url,
            policy_file,
            worker_tick: Duration::from_millis(tick_ms),
            engine: EngineConfig {
                max_retries,
                retry_base_delay,
                business_hours,
                queue_capacity,
                recent_window,
                ..engine_defaults
            },
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(name, &raw, &e.to_string())),
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
