//! Cache store connection settings.

use serde::{Deserialize, Serialize};

/// Redis connection configuration.
///
/// With `enabled = false` (the default) the engine runs on the in-process
/// store, which is only correct for single-instance deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Per-command and connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    16
}

fn default_redis_timeout_ms() -> u64 {
    250
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && !(self.url.starts_with("redis://") || self.url.starts_with("rediss://")) {
            return Err(format!("store.url must be a redis:// or rediss:// URL, got {:?}", self.url));
        }
        if self.pool_size == 0 {
            return Err("store.pool_size must be greater than 0".to_string());
        }
        if self.timeout_ms == 0 {
            return Err("store.timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}
