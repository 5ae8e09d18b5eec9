//! Engine configuration.
//!
//! Every section has working defaults, so an empty file (or none at all)
//! yields a single-instance engine on the in-process store.
//!
//! ```toml
//! [store]
//! key_root = "rowscope"
//!
//! [store.redis]
//! enabled = true
//! url = "redis://localhost:6379"
//!
//! [cache]
//! entry_ttl = "6h"
//! warehouse_timeout = "30s"
//!
//! [warming]
//! lease_ttl = "5m"
//! concurrency = 8
//! job_retention = "1h"
//!
//! [logging]
//! level = "info"
//! install_subscriber = true
//! ```

use std::time::Duration;

use rowscope_store::RedisConfig;
use serde::{Deserialize, Serialize};

use crate::cache::CacheSettings;
use crate::health::HealthConfig;
use crate::keyspace::DEFAULT_KEY_ROOT;
use crate::retry::RetryPolicy;
use crate::warming::WarmingConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl ConfigError {
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidValue(message.into())
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        Self::Load(err.to_string())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreSection,
    pub cache: CacheSettings,
    pub warming: WarmingConfig,
    pub retry: RetryPolicy,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

/// Cache store backend and key layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub redis: RedisConfig,

    /// Prefix of every key the engine writes.
    pub key_root: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            key_root: DEFAULT_KEY_ROOT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,

    /// Install the global tracing subscriber when the service is built.
    /// Turn off when the host process sets up its own.
    pub install_subscriber: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            install_subscriber: true,
        }
    }
}

impl EngineConfig {
    /// Check value ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for the first problem found, or
    /// `ConfigError::Missing` for an empty key root.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.redis.validate().map_err(ConfigError::InvalidValue)?;
        if self.store.key_root.trim().is_empty() {
            return Err(ConfigError::Missing("store.key_root".to_string()));
        }
        if self.store.key_root.contains(':') {
            return Err(ConfigError::invalid(format!(
                "store.key_root must not contain ':', got {:?}",
                self.store.key_root
            )));
        }

        non_zero("cache.entry_ttl", self.cache.entry_ttl)?;
        non_zero("cache.warehouse_timeout", self.cache.warehouse_timeout)?;
        self.cache
            .columns
            .validate()
            .map_err(|e| ConfigError::invalid(format!("cache.columns: {e}")))?;

        non_zero("warming.lease_ttl", self.warming.lease_ttl)?;
        if self.warming.concurrency == 0 {
            return Err(ConfigError::invalid("warming.concurrency must be greater than 0"));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::invalid(
                "retry.base_delay must not exceed retry.max_delay",
            ));
        }

        let weights = &self.health.weights;
        if [weights.recency, weights.hit_rate, weights.coverage]
            .iter()
            .any(|w| !(0.0..=1.0).contains(w))
        {
            return Err(ConfigError::invalid("health.weights must each be within [0, 1]"));
        }
        if (weights.sum() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::invalid(format!(
                "health.weights must sum to 1.0, got {}",
                weights.sum()
            )));
        }
        if self.health.fresh_within >= self.health.stale_after {
            return Err(ConfigError::invalid(
                "health.fresh_within must be shorter than health.stale_after",
            ));
        }
        if self.health.hit_rate_window_minutes == 0 {
            return Err(ConfigError::invalid(
                "health.hit_rate_window_minutes must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.health.idle_hit_rate) {
            return Err(ConfigError::invalid("health.idle_hit_rate must be within [0, 1]"));
        }

        check_log_level(&self.logging.level)?;

        Ok(())
    }

    /// Render as TOML, e.g. to print the effective configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a value cannot be represented.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::invalid(e.to_string()))
    }
}

pub(crate) fn check_log_level(level: &str) -> Result<(), ConfigError> {
    if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::invalid(format!(
            "logging.level must be one of {LOG_LEVELS:?}, got {level:?}"
        )));
    }
    Ok(())
}

fn non_zero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid(format!("{field} must be greater than 0")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthWeights;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            [cache]
            entry_ttl = "90m"

            [cache.columns]
            facility = "site_id"

            [warming]
            concurrency = 2

            [health.weights]
            recency = 0.5
            hit_rate = 0.25
            coverage = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.entry_ttl, Duration::from_secs(90 * 60));
        assert_eq!(config.cache.columns.facility, "site_id");
        assert_eq!(config.cache.columns.practitioner, "practitioner_id");
        assert_eq!(config.warming.concurrency, 2);
        assert_eq!(config.warming.lease_ttl, Duration::from_secs(300));
        assert_eq!(config.warming.job_retention, Duration::from_secs(3600));
        assert_eq!(config.store.key_root, "rowscope");
        config.validate().unwrap();
    }

    #[test]
    fn test_to_toml_parses_back() {
        let config = EngineConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: EngineConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut config = EngineConfig::default();
        config.cache.entry_ttl = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        let mut config = EngineConfig::default();
        config.warming.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unbalanced_weights() {
        let mut config = EngineConfig::default();
        config.health.weights = HealthWeights {
            recency: 0.5,
            hit_rate: 0.5,
            coverage: 0.5,
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_rejects_bad_columns_and_levels() {
        let mut config = EngineConfig::default();
        config.cache.columns.facility = "facility; drop".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.store.key_root = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));
    }
}
