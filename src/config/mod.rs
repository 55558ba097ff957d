//! # Configuration
//!
//! Layered engine configuration: compiled defaults, an optional
//! `dispatch.toml` (or `.yaml`/`.json`) file, then `DISPATCH__*` environment
//! overrides. Every field has a default so an empty environment yields a
//! working engine.
//!
//! ```bash
//! DISPATCH__CONCURRENCY=10
//! DISPATCH__RETRY__MAX_ATTEMPTS=5
//! DISPATCH__RATE_LIMITS__LOW_MS=1000
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    BATCH_RETENTION_HOURS, COMPLETION_CHECK_DELAY, COMPLETION_PAGE_SIZE, DEFAULT_CONCURRENCY,
    DEFAULT_EVENT_CAPACITY, DUPLICATE_RETENTION_DAYS, RATE_DELAY_HIGH_MS, RATE_DELAY_LOW_MS,
    RATE_DELAY_NORMAL_MS,
};
use crate::dispatch::RetryPolicy;

/// Inter-send pacing per priority tier, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub high_ms: u64,
    pub normal_ms: u64,
    pub low_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            high_ms: RATE_DELAY_HIGH_MS,
            normal_ms: RATE_DELAY_NORMAL_MS,
            low_ms: RATE_DELAY_LOW_MS,
        }
    }
}

/// Completion detector timing and pagination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    /// Delay between a drained queue and the ground-truth recount.
    pub check_delay_secs: u64,
    /// Messages fetched per recount page.
    pub page_size: i64,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            check_delay_secs: COMPLETION_CHECK_DELAY.as_secs(),
            page_size: COMPLETION_PAGE_SIZE,
        }
    }
}

impl CompletionSettings {
    pub fn check_delay(&self) -> Duration {
        Duration::from_secs(self.check_delay_secs)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Concurrent in-flight sends per batch.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub rate_limits: RateLimitSettings,
    /// Duplicate suppression window, in days.
    pub duplicate_retention_days: i64,
    pub completion: CompletionSettings,
    /// How long finished batches stay resident in memory, in hours.
    pub batch_retention_hours: u64,
    /// Broadcast channel capacity for progress events.
    pub event_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            rate_limits: RateLimitSettings::default(),
            duplicate_retention_days: DUPLICATE_RETENTION_DAYS,
            completion: CompletionSettings::default(),
            batch_retention_hours: BATCH_RETENTION_HOURS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from `dispatch.*` in the working directory (if
    /// present) and `DISPATCH__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("dispatch")
    }

    /// Load with an explicit config file base name.
    pub fn load_from(file_base: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(file_base).required(false))
            .add_source(Environment::with_prefix("DISPATCH").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn batch_retention(&self) -> Duration {
        Duration::from_secs(self.batch_retention_hours * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.rate_limits.low_ms, 500);
        assert_eq!(config.completion.check_delay(), Duration::from_secs(30));
        assert_eq!(config.batch_retention(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_deserialize_partial_overrides() {
        let config: DispatchConfig = serde_json::from_str(
            r#"{"concurrency": 10, "retry": {"max_attempts": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.retry.max_attempts, 5);
        // Untouched sections keep their defaults
        assert_eq!(config.retry.backoff_minutes, 1);
        assert_eq!(config.rate_limits.normal_ms, 200);
    }
}
