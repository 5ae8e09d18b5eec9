//! Relational warehouse seam.
//!
//! The engine hands the warehouse fully scoped [`AnalyticsQuery`] values;
//! implementations render them with [`AnalyticsQuery::render`] and bind the
//! parameters. Caller-supplied values never reach SQL text.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rowscope_auth::AnalyticsQuery;
use rowscope_core::{ColumnSpec, ColumnType, DataSourceId, ResultSet};
use serde_json::Value;

use crate::EngineResult;
use crate::dimension::DimensionKey;
use crate::error::EngineError;

/// Parameterized query execution against the analytics warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Execute a scoped query against one data source.
    async fn execute(
        &self,
        data_source: &DataSourceId,
        query: &AnalyticsQuery,
    ) -> EngineResult<ResultSet>;

    /// Every dimension key a full warm of `data_source` should compute.
    async fn warm_keys(&self, data_source: &DataSourceId) -> EngineResult<Vec<DimensionKey>>;
}

// =============================================================================
// In-memory warehouse
// =============================================================================

type Row = HashMap<String, Value>;

#[derive(Debug, Default)]
struct Relation {
    columns: Vec<ColumnSpec>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct Partition {
    relations: HashMap<String, Relation>,
    warm_keys: Vec<DimensionKey>,
}

/// Warehouse over in-process relations.
///
/// Evaluates the query's predicates row by row with SQL NULL semantics.
/// Useful for embedding, demos and tests; it counts executions and can be
/// slowed down or failed on demand.
#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    partitions: Arc<DashMap<DataSourceId, Partition>>,
    executions: Arc<AtomicUsize>,
    delay: Arc<std::sync::Mutex<Option<Duration>>>,
    fail_remaining: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MemoryWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWarehouse")
            .field("partitions", &self.partitions.len())
            .field("executions", &self.executions())
            .finish_non_exhaustive()
    }
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a relation. Column types are taken from `columns`.
    pub fn define_relation(&self, ds: &DataSourceId, relation: &str, columns: Vec<ColumnSpec>) {
        self.partitions
            .entry(ds.clone())
            .or_default()
            .relations
            .insert(
                relation.to_string(),
                Relation {
                    columns,
                    rows: Vec::new(),
                },
            );
    }

    /// Append a row given as `(column, value)` pairs. Missing columns read
    /// as NULL.
    pub fn insert_row<I, S>(&self, ds: &DataSourceId, relation: &str, values: I)
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let mut partition = self.partitions.entry(ds.clone()).or_default();
        let relation = partition
            .relations
            .entry(relation.to_string())
            .or_default();
        relation
            .rows
            .push(values.into_iter().map(|(k, v)| (k.into(), v)).collect());
    }

    /// Register a key returned by [`Warehouse::warm_keys`].
    pub fn add_warm_key(&self, key: DimensionKey) {
        self.partitions
            .entry(key.data_source.clone())
            .or_default()
            .warm_keys
            .push(key);
    }

    /// Sleep this long before answering each query.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut guard) = self.delay.lock() {
            *guard = delay;
        }
    }

    /// Fail the next `count` executions.
    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of queries executed so far, including failed ones.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    fn column_type(relation: &Relation, column: &str) -> ColumnType {
        relation
            .columns
            .iter()
            .find(|c| c.name == column)
            .map_or(ColumnType::Json, |c| c.data_type)
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn execute(
        &self,
        data_source: &DataSourceId,
        query: &AnalyticsQuery,
    ) -> EngineResult<ResultSet> {
        self.executions.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::warehouse("injected warehouse failure"));
        }

        // Validates identifiers the same way a SQL backend would.
        query.render()?;

        let partition = self
            .partitions
            .get(data_source)
            .ok_or_else(|| EngineError::warehouse(format!("unknown data source {data_source}")))?;
        let relation = partition.relations.get(&query.relation).ok_or_else(|| {
            EngineError::warehouse(format!("unknown relation {}", query.relation))
        })?;

        let mut result = ResultSet::new(
            query
                .projection
                .iter()
                .map(|c| ColumnSpec::new(c.as_str(), Self::column_type(relation, c)))
                .collect(),
        );
        if query.is_short_circuited() {
            return Ok(result);
        }

        for row in &relation.rows {
            if !query.matches_row(&|column: &str| row.get(column)) {
                continue;
            }
            let projected = query
                .projection
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            result.push_row(projected)?;
        }
        Ok(result)
    }

    async fn warm_keys(&self, data_source: &DataSourceId) -> EngineResult<Vec<DimensionKey>> {
        Ok(self
            .partitions
            .get(data_source)
            .map(|p| p.warm_keys.clone())
            .unwrap_or_default())
    }
}
