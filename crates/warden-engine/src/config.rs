//! # Engine Configuration
//!
//! Tunables for retries, queue bounds, the business-hours window used by
//! `time_based` conditions, and the look-back window for policy stats.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error parsing a configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Business hours must be `HH-HH` with `start < end <= 24`.
    #[error("invalid business hours \"{0}\" (expected HH-HH, e.g. 08-18)")]
    InvalidBusinessHours(String),
}

// ---------------------------------------------------------------------------
// BusinessHours
// ---------------------------------------------------------------------------

/// Working-hours window in UTC, Monday to Friday.
///
/// Anything outside `[start_hour, end_hour)` on a weekday, and all of
/// Saturday and Sunday, counts as after hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    /// First hour (inclusive) of the working day.
    pub start_hour: u32,
    /// Hour (exclusive) at which the working day ends.
    pub end_hour: u32,
}

impl BusinessHours {
    /// Construct a window, validating `start < end <= 24`.
    pub fn new(start_hour: u32, end_hour: u32) -> Result<Self, ConfigError> {
        if start_hour >= end_hour || end_hour > 24 {
            return Err(ConfigError::InvalidBusinessHours(format!(
                "{start_hour:02}-{end_hour:02}"
            )));
        }
        Ok(Self {
            start_hour,
            end_hour,
        })
    }

    /// Whether `at` falls outside the working-hours window.
    pub fn is_after_hours(&self, at: DateTime<Utc>) -> bool {
        if matches!(at.weekday(), Weekday::Sat | Weekday::Sun) {
            return true;
        }
        let hour = at.hour();
        hour < self.start_hour || hour >= self.end_hour
    }
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 8,
            end_hour: 18,
        }
    }
}

impl FromStr for BusinessHours {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidBusinessHours(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start: u32 = start.trim().parse().map_err(|_| invalid())?;
        let end: u32 = end.trim().parse().map_err(|_| invalid())?;
        Self::new(start, end).map_err(|_| invalid())
    }
}

impl std::fmt::Display for BusinessHours {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}-{:02}", self.start_hour, self.end_hour)
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Upper bound on [`EngineConfig::max_retries`].
pub const MAX_RETRIES: u32 = 20;

/// Upper bound on [`EngineConfig::retry_base_delay`], in seconds.
pub const MAX_RETRY_BASE_SECS: i64 = 86_400;

/// Engine-wide settings. Defaults match the service's environment defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retries after the first failed attempt of a transient failure.
    pub max_retries: u32,
    /// Base of the exponential backoff: retry `n` waits `base × 2^n`.
    pub retry_base_delay: Duration,
    /// Window used by `time_based` conditions.
    pub business_hours: BusinessHours,
    /// Maximum number of jobs held by the timer queue.
    pub queue_capacity: usize,
    /// Maximum number of entries held by the in-memory audit trail.
    pub audit_capacity: usize,
    /// Look-back window for `recent_executions` in policy stats.
    pub recent_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::seconds(30),
            business_hours: BusinessHours::default(),
            queue_capacity: 100_000,
            audit_capacity: 10_000,
            recent_window: Duration::hours(24),
        }
    }
}

impl EngineConfig {
    /// Backoff before retry number `retry` (0-based).
    /// Saturates at one year instead of overflowing.
    pub fn backoff(&self, retry: u32) -> Duration {
        let cap = Duration::days(365);
        let factor = 1i64 << retry.min(MAX_RETRIES);
        self.retry_base_delay
            .num_milliseconds()
            .checked_mul(factor)
            .and_then(Duration::try_milliseconds)
            .map_or(cap, |d| d.min(cap))
    }
}
