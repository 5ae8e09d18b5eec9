//! Backend selection with graceful degradation.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RedisConfig;
use crate::memory::InMemoryCacheStore;
use crate::redis_store::RedisCacheStore;
use crate::traits::CacheStore;

/// Create a cache store based on configuration.
///
/// ## Store Modes
///
/// - **Redis disabled**: in-process store
/// - **Redis enabled**: Redis pool, falling back to the in-process store if
///   the pool cannot be created or the first connection fails
///
/// Falling back keeps the engine serving, at the cost of per-instance
/// caches and per-instance warming leases.
pub async fn create_cache_store(config: &RedisConfig) -> Arc<dyn CacheStore> {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-memory cache store");
        return Arc::new(InMemoryCacheStore::new());
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let timeout = Duration::from_millis(config.timeout_ms);
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to in-memory cache store."
            );
            return Arc::new(InMemoryCacheStore::new());
        }
    };

    let store = RedisCacheStore::new(pool, timeout);
    match store.ping().await {
        Ok(()) => {
            tracing::info!("Connected to Redis");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to in-memory cache store."
            );
            Arc::new(InMemoryCacheStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_uses_memory() {
        let store = create_cache_store(&RedisConfig::default()).await;
        assert_eq!(store.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_unreachable_redis_degrades() {
        let config = RedisConfig {
            enabled: true,
            url: "redis://127.0.0.1:1".to_string(),
            timeout_ms: 100,
            ..Default::default()
        };
        let store = create_cache_store(&config).await;
        assert_eq!(store.backend_name(), "memory");
    }
}
