//! Secondary-index cache engine.
//!
//! ## Read path
//!
//! 1. Deny-all callers short-circuit: no lookup, no warehouse query.
//! 2. Look up the unrestricted entry for the dimension key, then the entry
//!    computed under the caller's own scope. Either way the payload is
//!    re-filtered in memory before it is returned.
//! 3. On a miss, query the warehouse through the filter injector, store the
//!    result (empty results included) and index it.
//! 4. If the store is unavailable after one retry, serve straight from the
//!    warehouse and count a slow-path read.
//!
//! ## Index layout
//!
//! Every write adds the entry id to the master index, to one index set per
//! [`IndexTerm`] and records the terms in the term registry. All of it is
//! applied as one atomic store operation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rowscope_auth::{AnalyticsQuery, EffectiveFilter, FilterInjector, ScopeColumns};
use rowscope_core::{ColumnSpec, ColumnType, DataSourceId, ResultSet};
use rowscope_store::{AtomicOp, CacheStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::EngineResult;
use crate::dimension::{DimensionKey, IndexTerm};
use crate::entry::{CacheEntry, entry_id, from_unix_millis, unix_millis};
use crate::error::EngineError;
use crate::health::{Coverage, HealthInputs};
use crate::keyspace::{Keyspace, Namespace};
use crate::retry::RetryPolicy;
use crate::stats::CacheStats;
use crate::warehouse::Warehouse;

/// Read-path settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Lifetime of a cache entry, checked passively on read.
    #[serde(with = "humantime_serde")]
    pub entry_ttl: Duration,

    /// Deadline for a single warehouse query.
    #[serde(with = "humantime_serde")]
    pub warehouse_timeout: Duration,

    /// Row-level scoping columns of the analytics dataset.
    pub columns: ScopeColumns,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(6 * 3600),
            warehouse_timeout: Duration::from_secs(30),
            columns: ScopeColumns::default(),
        }
    }
}

/// Where a read was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    Cache,
    Warehouse,
    /// Warehouse, because the cache store was unavailable.
    SlowPath,
    /// Deny-all: nothing was queried.
    ShortCircuit,
}

/// Rows returned to a caller plus how they were obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub rows: ResultSet,
    pub cache_hit: bool,
    pub source: ReadSource,
}

/// Dimension-keyed result cache with inverted indices.
#[derive(Clone)]
pub struct SecondaryIndexCache {
    store: Arc<dyn CacheStore>,
    warehouse: Arc<dyn Warehouse>,
    injector: FilterInjector,
    keyspace: Keyspace,
    settings: CacheSettings,
    retry: RetryPolicy,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for SecondaryIndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryIndexCache")
            .field("backend", &self.store.backend_name())
            .field("keyspace", &self.keyspace)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SecondaryIndexCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        warehouse: Arc<dyn Warehouse>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            warehouse,
            injector: FilterInjector::new(settings.columns.clone()),
            keyspace: Keyspace::default(),
            settings,
            retry: RetryPolicy::default(),
            stats: Arc::new(CacheStats::default()),
        }
    }

    #[must_use]
    pub fn with_keyspace(mut self, keyspace: Keyspace) -> Self {
        self.keyspace = keyspace;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_stats(mut self, stats: Arc<CacheStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    fn columns(&self) -> &ScopeColumns {
        self.injector.columns()
    }

    // ==================== Read path ====================

    /// Serve `key` for a caller whose effective filter is `filter`.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidDimension` for a malformed key
    /// - `EngineError::WarehouseTimeout` if the warehouse did not answer
    ///   after one retry
    /// - any non-availability store error
    pub async fn read(&self, key: &DimensionKey, filter: &EffectiveFilter) -> EngineResult<CacheRead> {
        key.validate()?;
        let ds = &key.data_source;

        if filter.is_deny_all() {
            let query = self.scoped_query(key, filter);
            return Ok(CacheRead {
                rows: schema_only(&query),
                cache_hit: false,
                source: ReadSource::ShortCircuit,
            });
        }

        let digest = key.digest()?;
        match self
            .retry
            .run("cache lookup", || self.lookup(key, &digest, filter))
            .await
        {
            Ok(Some(entry)) => {
                self.stats.record_hit(ds);
                tracing::debug!(
                    data_source = %ds,
                    measure = %key.measure,
                    scope = %entry.scope,
                    "Cache hit"
                );
                return Ok(CacheRead {
                    rows: entry.scoped_payload(filter, self.columns()),
                    cache_hit: true,
                    source: ReadSource::Cache,
                });
            }
            Ok(None) => {}
            Err(err) if err.is_store_unavailable() => {
                return self.slow_path(key, filter, &err).await;
            }
            Err(err) => return Err(err),
        }

        self.stats.record_miss(ds);
        let rows = self.fetch_with_retry(key, filter).await?;
        let entry = CacheEntry::new(
            key.clone(),
            filter.clone(),
            rows,
            self.settings.entry_ttl,
            OffsetDateTime::now_utc(),
        );

        // The rows are valid whether or not they could be cached.
        if let Err(err) = self.write_entry(Namespace::Production, &entry).await {
            tracing::warn!(
                data_source = %ds,
                measure = %key.measure,
                error = %err,
                "Failed to cache warehouse result"
            );
        }

        Ok(CacheRead {
            rows: entry.scoped_payload(filter, self.columns()),
            cache_hit: false,
            source: ReadSource::Warehouse,
        })
    }

    async fn lookup(
        &self,
        key: &DimensionKey,
        digest: &str,
        filter: &EffectiveFilter,
    ) -> EngineResult<Option<CacheEntry>> {
        let ds = &key.data_source;
        let mut candidates = vec![entry_id(digest, &EffectiveFilter::Unrestricted)];
        if !filter.is_unrestricted() {
            candidates.push(entry_id(digest, filter));
        }

        let now = OffsetDateTime::now_utc();
        for id in candidates {
            let store_key = self.keyspace.entry(Namespace::Production, ds, &id);
            let Some(bytes) = self.store.get(&store_key).await? else {
                continue;
            };
            let entry = match CacheEntry::from_bytes(&store_key, &bytes) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(key = %store_key, error = %err, "Ignoring corrupt cache entry");
                    continue;
                }
            };
            if entry.is_expired(now) {
                tracing::debug!(key = %store_key, "Cache entry expired");
                continue;
            }
            if entry.key != *key || !entry.scope.covers(filter) {
                tracing::warn!(
                    key = %store_key,
                    scope = %entry.scope,
                    requested = %filter,
                    "Cache entry does not match request; ignoring"
                );
                continue;
            }
            return Ok(Some(entry));
        }
        Ok(None)
    }

    async fn slow_path(
        &self,
        key: &DimensionKey,
        filter: &EffectiveFilter,
        cause: &EngineError,
    ) -> EngineResult<CacheRead> {
        tracing::warn!(
            data_source = %key.data_source,
            measure = %key.measure,
            backend = self.store.backend_name(),
            error = %cause,
            "Cache store unavailable; serving from warehouse"
        );
        self.stats.record_slow_path(&key.data_source);
        let rows = self.fetch_with_retry(key, filter).await?;
        Ok(CacheRead {
            rows,
            cache_hit: false,
            source: ReadSource::SlowPath,
        })
    }

    fn scoped_query(&self, key: &DimensionKey, filter: &EffectiveFilter) -> AnalyticsQuery {
        self.injector
            .scope_query(key.to_query(self.columns()), filter)
    }

    /// Query the warehouse for `key` under `filter`, with the configured
    /// deadline. The result is re-filtered before it is returned.
    pub async fn fetch(&self, key: &DimensionKey, filter: &EffectiveFilter) -> EngineResult<ResultSet> {
        let query = self.scoped_query(key, filter);
        if query.is_short_circuited() {
            return Ok(schema_only(&query));
        }

        let timeout = self.settings.warehouse_timeout;
        let mut rows =
            match tokio::time::timeout(timeout, self.warehouse.execute(&key.data_source, &query))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(EngineError::warehouse_timeout(
                        key.data_source.clone(),
                        timeout,
                    ));
                }
            };

        let dropped = filter.apply(&mut rows, self.columns());
        if dropped > 0 {
            tracing::warn!(
                data_source = %key.data_source,
                measure = %key.measure,
                dropped,
                "Warehouse returned rows outside the caller's scope"
            );
        }
        Ok(rows)
    }

    pub(crate) async fn fetch_with_retry(
        &self,
        key: &DimensionKey,
        filter: &EffectiveFilter,
    ) -> EngineResult<ResultSet> {
        self.retry
            .run("warehouse query", || self.fetch(key, filter))
            .await
    }

    // ==================== Writes and indices ====================

    /// Store an entry and index it, atomically. Returns the entry id.
    pub async fn write_entry(&self, ns: Namespace, entry: &CacheEntry) -> EngineResult<String> {
        let ds = &entry.key.data_source;
        let id = entry.entry_id()?;
        let terms = entry.terms(self.columns());

        let mut ops = Vec::with_capacity(terms.len() + 3);
        ops.push(AtomicOp::Set {
            key: self.keyspace.entry(ns, ds, &id),
            value: entry.to_bytes()?,
            ttl: None,
        });
        ops.push(AtomicOp::SetAdd {
            key: self.keyspace.master_index(ns, ds),
            members: vec![id.clone()],
        });
        for term in &terms {
            ops.push(AtomicOp::SetAdd {
                key: self.keyspace.index(ns, ds, term),
                members: vec![id.clone()],
            });
        }
        ops.push(AtomicOp::SetAdd {
            key: self.keyspace.term_registry(ns, ds),
            members: terms.iter().map(ToString::to_string).collect(),
        });

        self.store.atomic(ops).await?;
        Ok(id)
    }

    /// Production entry ids mentioning `term`.
    pub async fn entries_for_term(
        &self,
        ds: &DataSourceId,
        term: &IndexTerm,
    ) -> EngineResult<BTreeSet<String>> {
        Ok(self
            .store
            .set_members(&self.keyspace.index(Namespace::Production, ds, term))
            .await?)
    }

    /// Production entry ids mentioning any of `terms`.
    pub async fn entries_for_any(
        &self,
        ds: &DataSourceId,
        terms: &[IndexTerm],
    ) -> EngineResult<BTreeSet<String>> {
        let keys: Vec<String> = terms
            .iter()
            .map(|t| self.keyspace.index(Namespace::Production, ds, t))
            .collect();
        Ok(self.store.set_union(&keys).await?)
    }

    /// Every entry id in a namespace's master index.
    pub async fn entry_ids(&self, ns: Namespace, ds: &DataSourceId) -> EngineResult<BTreeSet<String>> {
        Ok(self
            .store
            .set_members(&self.keyspace.master_index(ns, ds))
            .await?)
    }

    /// Terms with an index set in a namespace.
    pub async fn registered_terms(
        &self,
        ns: Namespace,
        ds: &DataSourceId,
    ) -> EngineResult<Vec<IndexTerm>> {
        let members = self
            .store
            .set_members(&self.keyspace.term_registry(ns, ds))
            .await?;
        Ok(members.into_iter().map(IndexTerm::from_stored).collect())
    }

    // ==================== Invalidation ====================

    /// Remove every production and shadow entry of a data source, with all
    /// their index sets. Returns the number of entries removed.
    ///
    /// The invalidation epoch is rotated before anything is scanned. A swap
    /// that committed earlier is caught by the scan; one that has not
    /// committed yet fails its epoch check.
    pub async fn invalidate(&self, ds: &DataSourceId) -> EngineResult<usize> {
        self.rotate_epoch(ds).await?;

        let mut keys = Vec::new();
        let mut removed = 0;
        for ns in [Namespace::Production, Namespace::Shadow] {
            let ns_keys = self
                .store
                .scan_prefix(&self.keyspace.namespace_prefix(ns, ds))
                .await?;
            removed += ns_keys
                .iter()
                .filter(|k| self.keyspace.entry_id_of(k).is_some())
                .count();
            keys.extend(ns_keys);
        }
        self.store.delete(&keys).await?;

        tracing::info!(data_source = %ds, removed, "Invalidated cached entries");
        Ok(removed)
    }

    /// Remove the entries mentioning `term`, in both namespaces, and drop
    /// their ids from every index. Returns the number of entries removed.
    pub async fn invalidate_term(&self, ds: &DataSourceId, term: &IndexTerm) -> EngineResult<usize> {
        self.rotate_epoch(ds).await?;

        let mut removed = 0;
        for ns in [Namespace::Production, Namespace::Shadow] {
            let ids: Vec<String> = self
                .store
                .set_members(&self.keyspace.index(ns, ds, term))
                .await?
                .into_iter()
                .collect();
            if ids.is_empty() {
                continue;
            }

            let mut ops: Vec<AtomicOp> = ids
                .iter()
                .map(|id| AtomicOp::Delete {
                    key: self.keyspace.entry(ns, ds, id),
                })
                .collect();
            ops.push(AtomicOp::SetRemove {
                key: self.keyspace.master_index(ns, ds),
                members: ids.clone(),
            });
            for other in self.registered_terms(ns, ds).await? {
                ops.push(AtomicOp::SetRemove {
                    key: self.keyspace.index(ns, ds, &other),
                    members: ids.clone(),
                });
            }
            self.store.atomic(ops).await?;
            removed += ids.len();
        }

        tracing::info!(data_source = %ds, term = %term, removed, "Invalidated cached entries by term");
        Ok(removed)
    }

    async fn rotate_epoch(&self, ds: &DataSourceId) -> EngineResult<()> {
        let token = uuid::Uuid::new_v4().to_string();
        self.store
            .set(&self.keyspace.epoch(ds), token.into_bytes(), None)
            .await?;
        Ok(())
    }

    /// Current invalidation epoch token, `None` if never invalidated.
    pub async fn epoch(&self, ds: &DataSourceId) -> EngineResult<Option<String>> {
        let bytes = self.store.get(&self.keyspace.epoch(ds)).await?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    // ==================== Shadow namespace ====================

    /// Delete every shadow key of a data source. Returns how many keys
    /// were deleted.
    pub async fn clear_shadow(&self, ds: &DataSourceId) -> EngineResult<usize> {
        let keys = self
            .store
            .scan_prefix(&self.keyspace.namespace_prefix(Namespace::Shadow, ds))
            .await?;
        Ok(self.store.delete(&keys).await?)
    }

    /// Move every shadow entry into production and merge the shadow index
    /// sets into the production ones, in one atomic operation.
    ///
    /// The operation only applies while the invalidation epoch still equals
    /// `expected_epoch`, so an invalidation that rotated the epoch after the
    /// shadow was written can never be undone by the swap.
    ///
    /// Returns the number of entries promoted.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::SwapFailed` if the epoch moved or the store did
    /// not apply the operation; production is then exactly as before.
    pub async fn promote_shadow(
        &self,
        ds: &DataSourceId,
        warmed_at: OffsetDateTime,
        expected_epoch: Option<&str>,
    ) -> EngineResult<usize> {
        let ids = self.entry_ids(Namespace::Shadow, ds).await?;
        let terms = self.registered_terms(Namespace::Shadow, ds).await?;

        let mut ops = Vec::with_capacity(ids.len() + terms.len() + 4);
        ops.push(AtomicOp::Expect {
            key: self.keyspace.epoch(ds),
            value: expected_epoch.map(|epoch| epoch.as_bytes().to_vec()),
        });
        for id in &ids {
            ops.push(AtomicOp::Rename {
                from: self.keyspace.entry(Namespace::Shadow, ds, id),
                to: self.keyspace.entry(Namespace::Production, ds, id),
            });
        }
        for term in &terms {
            ops.push(AtomicOp::UnionInto {
                destination: self.keyspace.index(Namespace::Production, ds, term),
                source: self.keyspace.index(Namespace::Shadow, ds, term),
            });
        }
        ops.push(AtomicOp::UnionInto {
            destination: self.keyspace.master_index(Namespace::Production, ds),
            source: self.keyspace.master_index(Namespace::Shadow, ds),
        });
        ops.push(AtomicOp::UnionInto {
            destination: self.keyspace.term_registry(Namespace::Production, ds),
            source: self.keyspace.term_registry(Namespace::Shadow, ds),
        });
        ops.push(AtomicOp::Set {
            key: self.keyspace.last_warmed(ds),
            value: unix_millis(warmed_at).to_string().into_bytes(),
            ttl: None,
        });

        self.store
            .atomic(ops)
            .await
            .map_err(|err| EngineError::swap_failed(ds.clone(), err.to_string()))?;
        Ok(ids.len())
    }

    // ==================== Metadata ====================

    /// Time of the last successful swap.
    pub async fn last_warmed(&self, ds: &DataSourceId) -> EngineResult<Option<OffsetDateTime>> {
        let Some(bytes) = self.store.get(&self.keyspace.last_warmed(ds)).await? else {
            return Ok(None);
        };
        let millis = std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                EngineError::corrupt_entry(self.keyspace.last_warmed(ds), "not a timestamp")
            })?;
        Ok(Some(from_unix_millis(millis)))
    }

    /// Dimension kinds present in the production index.
    pub async fn coverage(&self, ds: &DataSourceId) -> EngineResult<Coverage> {
        let terms = self.registered_terms(Namespace::Production, ds).await?;
        Ok(Coverage {
            has_measure: terms.iter().any(IndexTerm::is_measure),
            has_facility: terms.iter().any(IndexTerm::is_facility),
        })
    }

    /// Everything the health scorer needs for one data source.
    pub async fn health_inputs(&self, ds: &DataSourceId) -> EngineResult<HealthInputs> {
        Ok(HealthInputs {
            last_warmed: self.last_warmed(ds).await?,
            hit_rate: self.stats.hit_rate(ds),
            coverage: self.coverage(ds).await?,
        })
    }
}

/// Empty result carrying the projected schema.
fn schema_only(query: &AnalyticsQuery) -> ResultSet {
    ResultSet::new(
        query
            .projection
            .iter()
            .map(|c| ColumnSpec::new(c.as_str(), ColumnType::Json))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::{Granularity, TimeRange};
    use crate::warehouse::MemoryWarehouse;
    use rowscope_core::{FacilityId, PractitionerId};
    use rowscope_store::InMemoryCacheStore;
    use serde_json::json;
    use time::macros::datetime;

    fn ds() -> DataSourceId {
        DataSourceId::parse("claims").unwrap()
    }

    fn key() -> DimensionKey {
        DimensionKey::new(
            ds(),
            "visits",
            Granularity::Day,
            TimeRange::new(datetime!(2024-01-01 0:00 UTC), datetime!(2024-01-02 0:00 UTC)),
        )
    }

    fn seeded_warehouse() -> MemoryWarehouse {
        let wh = MemoryWarehouse::new();
        let bucket = datetime!(2024-01-01 0:00 UTC).unix_timestamp();
        for (facility, practitioner, value) in [
            (json!(1), json!(42), 5),
            (json!(2), json!(43), 7),
            (json!(3), json!(null), 11),
        ] {
            wh.insert_row(
                &ds(),
                "visits",
                [
                    ("granularity", json!("day")),
                    ("bucket_start", json!(bucket)),
                    ("facility_id", facility),
                    ("practitioner_id", practitioner),
                    ("value", json!(value)),
                ],
            );
        }
        wh
    }

    fn cache(store: Arc<InMemoryCacheStore>, wh: MemoryWarehouse) -> SecondaryIndexCache {
        SecondaryIndexCache::new(store, Arc::new(wh), CacheSettings::default()).with_retry(
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                jitter: false,
                ..RetryPolicy::default()
            },
        )
    }

    fn facilities(ids: &[i64]) -> EffectiveFilter {
        EffectiveFilter::Facilities(ids.iter().copied().map(FacilityId::new).collect())
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let wh = seeded_warehouse();
        let cache = cache(Arc::new(InMemoryCacheStore::new()), wh.clone());

        let first = cache.read(&key(), &EffectiveFilter::Unrestricted).await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.rows.len(), 3);

        let second = cache.read(&key(), &EffectiveFilter::Unrestricted).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.rows, first.rows);
        assert_eq!(wh.executions(), 1);
    }

    #[tokio::test]
    async fn test_unrestricted_entry_is_refiltered_for_scoped_callers() {
        let wh = seeded_warehouse();
        let cache = cache(Arc::new(InMemoryCacheStore::new()), wh.clone());
        cache.read(&key(), &EffectiveFilter::Unrestricted).await.unwrap();

        let scoped = cache.read(&key(), &facilities(&[2, 3])).await.unwrap();
        assert!(scoped.cache_hit);
        assert_eq!(scoped.rows.distinct_integers("facility_id"), vec![2, 3]);
        assert_eq!(wh.executions(), 1);
    }

    #[tokio::test]
    async fn test_scoped_entry_is_never_served_to_broader_callers() {
        let wh = seeded_warehouse();
        let cache = cache(Arc::new(InMemoryCacheStore::new()), wh.clone());

        let narrow = cache.read(&key(), &facilities(&[1])).await.unwrap();
        assert_eq!(narrow.rows.len(), 1);

        let broad = cache.read(&key(), &EffectiveFilter::Unrestricted).await.unwrap();
        assert!(!broad.cache_hit);
        assert_eq!(broad.rows.len(), 3);

        let other = cache.read(&key(), &facilities(&[1, 2])).await.unwrap();
        // Served from the unrestricted entry written by the broad read.
        assert!(other.cache_hit);
        assert_eq!(other.rows.len(), 2);
        assert_eq!(wh.executions(), 2);
    }

    #[tokio::test]
    async fn test_deny_all_never_queries() {
        let wh = seeded_warehouse();
        let cache = cache(Arc::new(InMemoryCacheStore::new()), wh.clone());
        let read = cache.read(&key(), &EffectiveFilter::DenyAll).await.unwrap();
        assert_eq!(read.source, ReadSource::ShortCircuit);
        assert!(read.rows.is_empty());
        assert_eq!(wh.executions(), 0);
    }

    #[tokio::test]
    async fn test_practitioner_scope_sees_own_and_unattributed_rows() {
        let cache = cache(Arc::new(InMemoryCacheStore::new()), seeded_warehouse());
        let read = cache
            .read(&key(), &EffectiveFilter::Practitioner(PractitionerId::new(42)))
            .await
            .unwrap();
        let values: Vec<i64> = read.rows.distinct_integers("value");
        assert_eq!(values, vec![5, 11]);
    }

    #[tokio::test]
    async fn test_indices_are_written() {
        let store = Arc::new(InMemoryCacheStore::new());
        let cache = cache(store, seeded_warehouse());
        cache.read(&key(), &EffectiveFilter::Unrestricted).await.unwrap();

        let ids = cache
            .entries_for_term(&ds(), &IndexTerm::facility(FacilityId::new(2)))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(
            cache
                .entries_for_term(&ds(), &IndexTerm::measure("visits"))
                .await
                .unwrap(),
            ids
        );
        assert!(
            cache
                .entries_for_term(&ds(), &IndexTerm::facility(FacilityId::new(9)))
                .await
                .unwrap()
                .is_empty()
        );

        let coverage = cache.coverage(&ds()).await.unwrap();
        assert!(coverage.is_complete());
    }

    #[tokio::test]
    async fn test_store_outage_falls_back_to_warehouse() {
        let store = Arc::new(InMemoryCacheStore::new());
        let wh = seeded_warehouse();
        let cache = cache(store.clone(), wh.clone());
        store.set_unavailable(true);

        let read = cache.read(&key(), &facilities(&[1])).await.unwrap();
        assert_eq!(read.source, ReadSource::SlowPath);
        assert_eq!(read.rows.len(), 1);
        assert_eq!(cache.stats().slow_path_reads(), 1);
    }

    #[tokio::test]
    async fn test_warehouse_timeout_is_distinct() {
        let wh = seeded_warehouse();
        wh.set_delay(Some(Duration::from_millis(200)));
        let settings = CacheSettings {
            warehouse_timeout: Duration::from_millis(20),
            ..CacheSettings::default()
        };
        let cache = SecondaryIndexCache::new(Arc::new(InMemoryCacheStore::new()), Arc::new(wh.clone()), settings)
            .with_retry(RetryPolicy {
                base_delay: Duration::from_millis(1),
                jitter: false,
                ..RetryPolicy::default()
            });

        let err = cache.read(&key(), &EffectiveFilter::Unrestricted).await.unwrap_err();
        assert!(matches!(err, EngineError::WarehouseTimeout { .. }));
        // One retry.
        assert_eq!(wh.executions(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_removes_entries_and_indices() {
        let store = Arc::new(InMemoryCacheStore::new());
        let cache = cache(store.clone(), seeded_warehouse());
        cache.read(&key(), &EffectiveFilter::Unrestricted).await.unwrap();
        cache.read(&key(), &facilities(&[1])).await.unwrap();

        assert_eq!(cache.epoch(&ds()).await.unwrap(), None);
        let removed = cache.invalidate(&ds()).await.unwrap();
        // The scoped read was a hit on the unrestricted entry.
        assert_eq!(removed, 1);
        assert!(cache.epoch(&ds()).await.unwrap().is_some());
        assert!(
            cache
                .entries_for_term(&ds(), &IndexTerm::measure("visits"))
                .await
                .unwrap()
                .is_empty()
        );
        assert!(!cache.read(&key(), &EffectiveFilter::Unrestricted).await.unwrap().cache_hit);
    }

    #[tokio::test]
    async fn test_invalidate_term_keeps_other_entries() {
        let cache = cache(Arc::new(InMemoryCacheStore::new()), seeded_warehouse());
        let other = key().with_tag("region", "north");
        cache.read(&key(), &facilities(&[1])).await.unwrap();
        cache.read(&other, &facilities(&[2])).await.unwrap();

        let removed = cache
            .invalidate_term(&ds(), &IndexTerm::facility(FacilityId::new(1)))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = cache.entry_ids(Namespace::Production, &ds()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(cache.read(&other, &facilities(&[2])).await.unwrap().cache_hit);
        assert!(!cache.read(&key(), &facilities(&[1])).await.unwrap().cache_hit);
    }
}
