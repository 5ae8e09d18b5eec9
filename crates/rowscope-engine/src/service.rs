//! Public service facade.
//!
//! Wires the resolver, the cache engine and the warming coordinator
//! together and converts internal errors into [`ServiceError`], which is
//! all a caller ever sees. Full error detail is logged here and nowhere
//! else on the way out.

use std::sync::Arc;
use std::time::Duration;

use rowscope_auth::{AuditSink, AuthError, EffectiveFilter, IdentityStore, PermissionResolver};
use rowscope_core::{DataSourceId, OrganizationSource, ResultSet, SharedHierarchy};
use rowscope_store::{CacheStore, create_cache_store};
use serde::Serialize;
use time::OffsetDateTime;

use crate::cache::{ReadSource, SecondaryIndexCache};
use crate::config::{ConfigError, EngineConfig};
use crate::dimension::{DimensionKey, IndexTerm};
use crate::error::EngineError;
use crate::health::{HealthReport, HealthScorer};
use crate::keyspace::Keyspace;
use crate::observability;
use crate::stats::CacheStats;
use crate::warehouse::Warehouse;
use crate::warming::{JobId, WarmStart, WarmingCoordinator, WarmingStatus};

/// Refresh interval of a hierarchy created by the builder.
const DEFAULT_HIERARCHY_REFRESH: Duration = Duration::from_secs(300);

// =============================================================================
// Errors
// =============================================================================

/// Errors visible to callers of [`AnalyticsService`].
///
/// Deliberately coarse: denials never say why, infrastructure failures
/// never say which component failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Access denied")]
    AccessDenied,

    #[error("Service temporarily unavailable, retry after {retry_after:?}")]
    TemporarilyUnavailable { retry_after: Duration },

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Internal error")]
    Internal,
}

impl ServiceError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TemporarilyUnavailable { .. })
    }
}

/// Result type of the service facade.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Rows returned by [`AnalyticsService::query`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub rows: ResultSet,
    pub cache_hit: bool,
    pub source: ReadSource,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`AnalyticsService`].
///
/// The warehouse and the identity store are required. Without an explicit
/// store the backend is chosen from `config.store.redis`; without an
/// explicit hierarchy every organization-scoped caller resolves to deny-all
/// until [`AnalyticsService::refresh_hierarchy`] has run.
pub struct AnalyticsServiceBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn CacheStore>>,
    warehouse: Option<Arc<dyn Warehouse>>,
    identity: Option<Arc<dyn IdentityStore>>,
    hierarchy: Option<Arc<SharedHierarchy>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl AnalyticsServiceBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            warehouse: None,
            identity: None,
            hierarchy: None,
            audit: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_warehouse(mut self, warehouse: Arc<dyn Warehouse>) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityStore>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_hierarchy(mut self, hierarchy: Arc<SharedHierarchy>) -> Self {
        self.hierarchy = Some(hierarchy);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validate the configuration and assemble the service.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` without a warehouse or identity
    /// store, or the validation error of the configuration.
    pub async fn build(self) -> Result<AnalyticsService, ConfigError> {
        self.config.validate()?;
        let warehouse = self
            .warehouse
            .ok_or_else(|| ConfigError::Missing("warehouse".to_string()))?;
        let identity = self
            .identity
            .ok_or_else(|| ConfigError::Missing("identity store".to_string()))?;
        let store = match self.store {
            Some(store) => store,
            None => create_cache_store(&self.config.store.redis).await,
        };
        let hierarchy = self
            .hierarchy
            .unwrap_or_else(|| Arc::new(SharedHierarchy::new(DEFAULT_HIERARCHY_REFRESH)));
        let resolver = match self.audit {
            Some(audit) => PermissionResolver::with_audit_sink(hierarchy, audit),
            None => PermissionResolver::new(hierarchy),
        };

        let config = self.config;
        let stats = Arc::new(CacheStats::new(config.health.hit_rate_window_minutes));
        let cache = Arc::new(
            SecondaryIndexCache::new(store, warehouse, config.cache.clone())
                .with_keyspace(Keyspace::new(config.store.key_root.clone()))
                .with_retry(config.retry.clone())
                .with_stats(stats),
        );
        let warming = WarmingCoordinator::new(cache.clone(), config.warming.clone());

        if config.logging.install_subscriber && observability::init_tracing(&config.logging) {
            tracing::debug!(level = %config.logging.level, "Tracing subscriber installed");
        }

        tracing::info!(
            backend = cache.store().backend_name(),
            key_root = %config.store.key_root,
            "Analytics service ready"
        );

        Ok(AnalyticsService {
            resolver,
            identity,
            cache,
            warming,
            scorer: HealthScorer::new(config.health.clone()),
            retry_after: config.retry.max_delay.max(Duration::from_secs(1)),
        })
    }
}

// =============================================================================
// Service
// =============================================================================

/// Scoped analytics reads, warming and cache administration.
#[derive(Clone)]
pub struct AnalyticsService {
    resolver: PermissionResolver,
    identity: Arc<dyn IdentityStore>,
    cache: Arc<SecondaryIndexCache>,
    warming: WarmingCoordinator,
    scorer: HealthScorer,
    retry_after: Duration,
}

impl std::fmt::Debug for AnalyticsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsService")
            .field("resolver", &self.resolver)
            .field("cache", &self.cache)
            .field("retry_after", &self.retry_after)
            .finish_non_exhaustive()
    }
}

impl AnalyticsService {
    pub fn builder(config: EngineConfig) -> AnalyticsServiceBuilder {
        AnalyticsServiceBuilder::new(config)
    }

    pub fn cache(&self) -> &Arc<SecondaryIndexCache> {
        &self.cache
    }

    pub fn warming(&self) -> &WarmingCoordinator {
        &self.warming
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    /// Resolve a caller to its effective filter.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::AccessDenied` for deny-all callers and for
    /// callers with malformed grants.
    pub async fn resolve(&self, caller_id: &str) -> ServiceResult<EffectiveFilter> {
        let filter = self
            .resolver
            .resolve_caller(self.identity.as_ref(), caller_id)
            .await
            .map_err(|e| self.surface("resolve", e.into()))?;
        if filter.is_deny_all() {
            return Err(self.surface("resolve", AuthError::denied(caller_id).into()));
        }
        Ok(filter)
    }

    /// Read one dimension key on behalf of a caller.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::AccessDenied` if the caller may not read
    /// anything, `ServiceError::InvalidRequest` for a malformed key and
    /// `ServiceError::TemporarilyUnavailable` once local retries are spent.
    pub async fn query(&self, caller_id: &str, key: &DimensionKey) -> ServiceResult<QueryResponse> {
        let filter = self.resolve(caller_id).await?;
        let read = self
            .cache
            .read(key, &filter)
            .await
            .map_err(|e| self.surface("query", e))?;
        tracing::debug!(
            caller_id = %caller_id,
            data_source = %key.data_source,
            measure = %key.measure,
            cache_hit = read.cache_hit,
            rows = read.rows.len(),
            "Served analytics query"
        );
        Ok(QueryResponse {
            rows: read.rows,
            cache_hit: read.cache_hit,
            source: read.source,
        })
    }

    /// Start a shadow-and-swap refresh of a data source.
    ///
    /// Calling this while a job runs reports the running job instead of
    /// starting another one.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::TemporarilyUnavailable` if the lease cannot be
    /// taken because the store is down.
    pub async fn warm_data_source(&self, ds: &DataSourceId, force: bool) -> ServiceResult<WarmStart> {
        self.warming
            .start(ds, force)
            .await
            .map_err(|e| self.surface("warm", e))
    }

    /// # Errors
    ///
    /// Returns `ServiceError::NotFound` for unknown or pruned jobs.
    pub fn warming_status(&self, job_id: JobId) -> ServiceResult<WarmingStatus> {
        self.warming.status(job_id).ok_or_else(|| ServiceError::NotFound {
            resource: "warming job",
            id: job_id.to_string(),
        })
    }

    /// Request cancellation of a running job. Returns `false` if the job is
    /// unknown or already finished.
    pub fn cancel_warming(&self, job_id: JobId) -> bool {
        self.warming.cancel(job_id)
    }

    /// Drop every cached entry of a data source in both namespaces.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::TemporarilyUnavailable` if the store is down.
    pub async fn invalidate(&self, ds: &DataSourceId) -> ServiceResult<usize> {
        self.cache
            .invalidate(ds)
            .await
            .map_err(|e| self.surface("invalidate", e))
    }

    /// Drop the cached entries indexed under one term.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::TemporarilyUnavailable` if the store is down.
    pub async fn invalidate_term(&self, ds: &DataSourceId, term: &IndexTerm) -> ServiceResult<usize> {
        self.cache
            .invalidate_term(ds, term)
            .await
            .map_err(|e| self.surface("invalidate_term", e))
    }

    /// # Errors
    ///
    /// Returns `ServiceError::TemporarilyUnavailable` if the store is down.
    pub async fn health_report(&self, ds: &DataSourceId) -> ServiceResult<HealthReport> {
        let inputs = self
            .cache
            .health_inputs(ds)
            .await
            .map_err(|e| self.surface("health_report", e))?;
        Ok(self.scorer.score(ds, inputs, OffsetDateTime::now_utc()))
    }

    /// Reload the organization hierarchy from `source`.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::TemporarilyUnavailable` if the source fails;
    /// the previous snapshot stays active.
    pub async fn refresh_hierarchy(&self, source: &dyn OrganizationSource) -> ServiceResult<u64> {
        self.resolver
            .hierarchy()
            .refresh(source)
            .await
            .map(|snapshot| snapshot.version)
            .map_err(|e| self.surface("refresh_hierarchy", e.into()))
    }

    /// Change the log level at runtime. Returns `false` if the host process
    /// owns the tracing subscriber.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::InvalidRequest` for an unknown level.
    pub fn set_log_level(&self, level: &str) -> ServiceResult<bool> {
        observability::set_log_level(level).map_err(|e| ServiceError::InvalidRequest {
            message: e.to_string(),
        })
    }

    /// Log an internal error in full and reduce it to its public form.
    fn surface(&self, operation: &'static str, err: EngineError) -> ServiceError {
        let category = err.category();
        match err {
            EngineError::Auth(e) if e.is_access_denied() => {
                tracing::info!(operation, error = %e, "Access denied");
                ServiceError::AccessDenied
            }
            EngineError::Auth(e) if e.is_hierarchy_corruption() => {
                tracing::error!(operation, error = %e, "Resolution failed on corrupt hierarchy");
                ServiceError::Internal
            }
            EngineError::Auth(AuthError::IdentityStore { message }) => {
                tracing::warn!(operation, error = %message, "Identity store unavailable");
                self.unavailable()
            }
            EngineError::Auth(e @ (AuthError::InvalidIdentifier { .. } | AuthError::InvalidQuery { .. })) => {
                tracing::debug!(operation, error = %e, "Rejected request");
                ServiceError::InvalidRequest {
                    message: e.to_string(),
                }
            }
            EngineError::InvalidDimension { message } => {
                tracing::debug!(operation, error = %message, "Rejected request");
                ServiceError::InvalidRequest { message }
            }
            EngineError::NotFound { resource, id } => ServiceError::NotFound { resource, id },
            err if err.is_retryable() || matches!(err, EngineError::Warehouse { .. }) => {
                tracing::warn!(operation, category = ?category, error = %err, "Infrastructure failure");
                self.unavailable()
            }
            err => {
                tracing::error!(operation, category = ?category, error = %err, "Request failed");
                ServiceError::Internal
            }
        }
    }

    fn unavailable(&self) -> ServiceError {
        ServiceError::TemporarilyUnavailable {
            retry_after: self.retry_after,
        }
    }
}
