//! Cache store adapter contract.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// One step of an atomic multi-key operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicOp {
    /// Move `from` to `to`, replacing `to`. The whole operation aborts if
    /// `from` does not exist.
    Rename { from: String, to: String },
    /// `destination := destination ∪ source`. A missing source is empty.
    UnionInto { destination: String, source: String },
    /// Remove a key if present.
    Delete { key: String },
    /// Write a byte value, replacing any previous value.
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// Add members to a set.
    SetAdd { key: String, members: Vec<String> },
    /// Remove members from a set.
    SetRemove { key: String, members: Vec<String> },
    /// Abort the whole operation unless `key` currently holds `value`
    /// (`None` meaning absent). Writes nothing.
    Expect { key: String, value: Option<Vec<u8>> },
}

impl AtomicOp {
    /// Keys that must exist for the operation to apply.
    pub fn required_key(&self) -> Option<&str> {
        match self {
            Self::Rename { from, .. } => Some(from.as_str()),
            _ => None,
        }
    }

    /// Value a key must hold for the operation to apply.
    pub fn expected_value(&self) -> Option<(&str, Option<&[u8]>)> {
        match self {
            Self::Expect { key, value } => Some((key.as_str(), value.as_deref())),
            _ => None,
        }
    }

    /// Keys whose concurrent modification should abort the operation.
    pub fn watched_keys(&self) -> Vec<&str> {
        match self {
            Self::Expect { key, .. } => vec![key.as_str()],
            Self::Rename { from, to } => vec![from.as_str(), to.as_str()],
            Self::UnionInto {
                destination,
                source,
            } => vec![destination.as_str(), source.as_str()],
            _ => Vec::new(),
        }
    }
}

/// Key-value cache store with set operations, TTLs, leases and atomic
/// multi-key transactions.
///
/// Implementations must be thread-safe and must apply [`CacheStore::atomic`]
/// all-or-nothing: a reader never observes some but not all of its steps.
///
/// # Example
///
/// ```ignore
/// use rowscope_store::{AtomicOp, CacheStore};
///
/// async fn promote(store: &dyn CacheStore) -> StoreResult<()> {
///     store
///         .atomic(vec![
///             AtomicOp::Rename { from: "shadow:e1".into(), to: "prod:e1".into() },
///             AtomicOp::UnionInto { destination: "prod:idx".into(), source: "shadow:idx".into() },
///         ])
///         .await
/// }
/// ```
#[async_trait]
pub trait CacheStore: Send + Sync {
    // ==================== Values ====================

    /// Read a byte value. Returns `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::WrongType` if the key holds a set.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a byte value with an optional time-to-live.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<usize>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Set a time-to-live on an existing key. Returns `false` if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    // ==================== Sets ====================

    /// Add members, returning how many were new.
    async fn set_add(&self, key: &str, members: &[String]) -> StoreResult<usize>;

    /// Remove members, returning how many were present.
    async fn set_remove(&self, key: &str, members: &[String]) -> StoreResult<usize>;

    async fn set_members(&self, key: &str) -> StoreResult<BTreeSet<String>>;

    /// Union of several sets. Missing keys count as empty.
    async fn set_union(&self, keys: &[String]) -> StoreResult<BTreeSet<String>>;

    // ==================== Keyspace ====================

    /// All live keys starting with `prefix`, in no particular order.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    // ==================== Leases ====================

    /// Take the lease at `key` for `holder` if nobody holds it.
    async fn try_acquire_lease(&self, key: &str, holder: &str, ttl: Duration)
    -> StoreResult<bool>;

    /// Extend the lease if `holder` still owns it.
    async fn renew_lease(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool>;

    /// Release the lease if `holder` still owns it.
    async fn release_lease(&self, key: &str, holder: &str) -> StoreResult<bool>;

    async fn lease_holder(&self, key: &str) -> StoreResult<Option<String>>;

    // ==================== Transactions ====================

    /// Apply all operations atomically, in order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::TransactionAborted` if the operation could not be
    /// applied; in that case nothing was applied.
    async fn atomic(&self, ops: Vec<AtomicOp>) -> StoreResult<()>;

    // ==================== Health ====================

    /// Round-trip to the backend.
    async fn ping(&self) -> StoreResult<()>;

    /// Short backend name for logs (`memory`, `redis`).
    fn backend_name(&self) -> &'static str;
}
