//! # rowscope-engine
//!
//! Scope-aware secondary-index cache for multi-tenant analytics.
//!
//! Dimension-keyed warehouse results are cached with inverted indices per
//! data source and refreshed by shadow-and-swap warming, so readers never
//! see a partially written partition. Every cached payload is re-filtered
//! to the caller's effective filter before it leaves the engine.
//!
//! ## Modules
//!
//! - [`dimension`] - dimension keys, index terms and the warehouse query they map to
//! - [`keyspace`] - production/shadow key layout
//! - [`entry`] - stored cache entries and scope fingerprints
//! - [`warehouse`] - warehouse trait and an in-process warehouse
//! - [`cache`] - read path, indexing, invalidation and the shadow swap
//! - [`warming`] - warming jobs: lease, shadow writes, swap, cancellation
//! - [`stats`] - sliding-window hit statistics
//! - [`health`] - health scoring
//! - [`retry`] - local retry with backoff
//! - [`service`] - public facade and caller-visible errors
//! - [`config`] / [`loader`] - configuration and layered loading
//! - [`observability`] - tracing setup

pub mod cache;
pub mod config;
pub mod dimension;
pub mod entry;
pub mod error;
pub mod health;
pub mod keyspace;
pub mod loader;
pub mod observability;
pub mod retry;
pub mod service;
pub mod stats;
pub mod warehouse;
pub mod warming;

pub use cache::{CacheRead, CacheSettings, ReadSource, SecondaryIndexCache};
pub use config::{ConfigError, EngineConfig, LoggingConfig, StoreSection};
pub use dimension::{DimensionKey, Granularity, IndexTerm, TimeRange};
pub use entry::CacheEntry;
pub use error::{EngineError, ErrorCategory};
pub use health::{
    Coverage, HealthConfig, HealthInputs, HealthLabel, HealthReport, HealthScorer, HealthWeights,
};
pub use keyspace::{Keyspace, Namespace};
pub use loader::load_config;
pub use retry::RetryPolicy;
pub use service::{
    AnalyticsService, AnalyticsServiceBuilder, QueryResponse, ServiceError, ServiceResult,
};
pub use stats::{CacheStats, HitRateWindow};
pub use warehouse::{MemoryWarehouse, Warehouse};
pub use warming::{
    JobId, JobState, WarmProgress, WarmStart, WarmingConfig, WarmingCoordinator, WarmingStatus,
};

/// Type alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use rowscope_engine::prelude::*;
/// ```
pub mod prelude {
    pub use crate::EngineResult;
    pub use crate::cache::SecondaryIndexCache;
    pub use crate::config::EngineConfig;
    pub use crate::dimension::{DimensionKey, Granularity, TimeRange};
    pub use crate::error::EngineError;
    pub use crate::service::{AnalyticsService, QueryResponse, ServiceError};
    pub use crate::warehouse::Warehouse;
    pub use crate::warming::{JobId, JobState, WarmStart};
}
