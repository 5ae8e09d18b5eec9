//! # rowscope-store
//!
//! Cache store adapters for the rowscope secondary-index cache.
//!
//! The engine talks to a key-value store through the [`CacheStore`] trait:
//! byte values with TTLs, string sets, prefix scans, holder-checked leases
//! and all-or-nothing multi-key transactions.
//!
//! ## Backends
//!
//! - [`InMemoryCacheStore`] - single-instance store, also the test double
//! - [`RedisCacheStore`] - shared store for multi-instance deployments
//!
//! [`create_cache_store`] picks one from [`RedisConfig`] and degrades to the
//! in-memory store when Redis is unreachable at startup.

pub mod config;
mod error;
pub mod factory;
pub mod memory;
pub mod redis_store;
mod traits;

pub use config::RedisConfig;
pub use error::{ErrorCategory, StoreError, StoreResult};
pub use factory::create_cache_store;
pub use memory::InMemoryCacheStore;
pub use redis_store::RedisCacheStore;
pub use traits::{AtomicOp, CacheStore};
