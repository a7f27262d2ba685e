//! # Usage Counter Configuration
//!
//! One immutable [`UsageConfig`] value is handed to the engine at construction.
//! Every section has production defaults, can be loaded from TOML and
//! partially overridden from the environment.

use crate::error::{Result, UsageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`StorageConfig::database_path`].
pub const ENV_DB_PATH: &str = "FEATURE_USAGE_DB_PATH";

/// Environment variable overriding [`RetentionConfig::max_age_days`].
pub const ENV_MAX_AGE_DAYS: &str = "FEATURE_USAGE_MAX_AGE_DAYS";

/// Top-level configuration for the counter store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Lottery sampling of counter updates
    pub sampling: SamplingConfig,

    /// Limits on creation of brand-new counters
    pub insert_rate_limits: InsertRateLimits,

    /// Retention window and pruning cadence
    pub retention: RetentionConfig,

    /// Recent-hit cache sizing
    pub cache: CacheConfig,

    /// Durable store location
    pub storage: StorageConfig,
}

/// Lottery sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// When false every event credits exactly one hit
    pub enabled: bool,

    /// Target ratio of (hits per sampled hit) to the day's total hits
    pub ratio: f64,

    /// Lower bound on hits represented by one sampled hit
    pub min_factor: u64,

    /// Upper bound on hits represented by one sampled hit
    pub max_factor: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            enabled: true,
            ratio: 0.1,
            min_factor: 10,
            max_factor: 1_000,
        }
    }
}

/// A `(max_events, window)` sliding-window budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub max_events: u32,
    pub window_secs: u64,
}

impl WindowLimit {
    pub fn new(max_events: u32, window_secs: u64) -> Self {
        WindowLimit {
            max_events,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Safety limits on new counter rows, keyed by client address.
///
/// These exist so that bots randomizing their agent string or rotating
/// addresses cannot flood the store with fresh rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsertRateLimits {
    /// Budget per single client address
    pub ip: Option<WindowLimit>,

    /// Budget per /16 (IPv4) or /64 (IPv6) network
    pub subnet: Option<WindowLimit>,
}

impl Default for InsertRateLimits {
    fn default() -> Self {
        InsertRateLimits {
            ip: Some(WindowLimit::new(30, 60)),
            subnet: None,
        }
    }
}

impl InsertRateLimits {
    /// No limits at all: every new counter is admitted.
    pub fn unlimited() -> Self {
        InsertRateLimits {
            ip: None,
            subnet: None,
        }
    }
}

/// Retention window and pruning cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Rows older than this many days are eligible for deletion
    pub max_age_days: u32,

    /// Rows deleted per statement
    pub purge_batch_size: u64,

    /// On average one write in this many triggers a pruning pass
    pub purge_period: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            max_age_days: 90,
            purge_batch_size: 30,
            purge_period: 10,
        }
    }
}

/// Recent-hit cache sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime in seconds
    pub ttl_secs: u64,

    /// Maximum number of live entries
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: 60 * 60,
            capacity: 100_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Durable store location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database
    pub database_path: PathBuf,

    /// How long a statement waits on a locked database
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database_path: PathBuf::from("./var/data/feature_usage.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl UsageConfig {
    /// Parse a TOML document. Missing sections and fields keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: UsageConfig = toml::from_str(raw)?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            UsageError::Config(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `FEATURE_USAGE_*` environment overrides in place.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            if !path.is_empty() {
                self.storage.database_path = PathBuf::from(path);
            }
        }

        if let Ok(days) = std::env::var(ENV_MAX_AGE_DAYS) {
            self.retention.max_age_days = days.trim().parse().map_err(|e| {
                UsageError::Config(format!("{} must be an integer: {}", ENV_MAX_AGE_DAYS, e))
            })?;
        }

        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.sampling;
        if !s.ratio.is_finite() || s.ratio <= 0.0 {
            return Err(UsageError::Config(format!(
                "sampling.ratio must be a positive number, got {}",
                s.ratio
            )));
        }
        if s.min_factor == 0 {
            return Err(UsageError::Config(
                "sampling.min_factor must be at least 1".to_string(),
            ));
        }
        if s.max_factor < s.min_factor {
            return Err(UsageError::Config(format!(
                "sampling.max_factor ({}) is below sampling.min_factor ({})",
                s.max_factor, s.min_factor
            )));
        }

        for (name, limit) in [
            ("ip", self.insert_rate_limits.ip),
            ("subnet", self.insert_rate_limits.subnet),
        ] {
            if let Some(limit) = limit {
                if limit.window_secs == 0 {
                    return Err(UsageError::Config(format!(
                        "insert_rate_limits.{}.window_secs must be positive",
                        name
                    )));
                }
            }
        }

        if self.retention.purge_batch_size == 0 {
            return Err(UsageError::Config(
                "retention.purge_batch_size must be positive".to_string(),
            ));
        }
        if self.retention.purge_period == 0 {
            return Err(UsageError::Config(
                "retention.purge_period must be positive".to_string(),
            ));
        }

        if self.cache.ttl_secs == 0 || self.cache.capacity == 0 {
            return Err(UsageError::Config(
                "cache.ttl_secs and cache.capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
