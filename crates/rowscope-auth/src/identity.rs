//! Identity/role store abstraction.
//!
//! The store is an upstream collaborator: it is read-only from the point of
//! view of this crate and supplies memberships and raw grants per caller.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::context::{CallerContext, CallerRecord};
use crate::error::AuthError;

/// Read-only access to caller memberships and grants.
///
/// # Example
///
/// ```ignore
/// use rowscope_auth::identity::IdentityStore;
///
/// async fn example(store: &dyn IdentityStore) -> Result<(), AuthError> {
///     let context = store.caller_context("dr-house").await?;
///     println!("tier: {}", context.tier());
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Load the stored record for a caller.
    ///
    /// Returns `None` if the caller is unknown.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::IdentityStore` if the store cannot be read.
    async fn load_caller(&self, caller_id: &str) -> Result<Option<CallerRecord>, AuthError>;

    /// Load and parse a caller's authorization context.
    ///
    /// Unknown callers get an empty context, which resolves to deny-all.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::AmbiguousGrant` for malformed grants, or the
    /// store error from [`IdentityStore::load_caller`].
    async fn caller_context(&self, caller_id: &str) -> Result<CallerContext, AuthError> {
        match self.load_caller(caller_id).await? {
            Some(record) => record.into_context(),
            None => {
                tracing::debug!(caller_id = %caller_id, "Unknown caller resolves without grants");
                Ok(CallerContext::new(caller_id))
            }
        }
    }
}

/// In-process identity store backed by a concurrent map.
///
/// Used when memberships are pushed in by an embedding application, and in
/// tests.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityStore {
    callers: Arc<DashMap<String, CallerRecord>>,
}

impl StaticIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a caller record.
    pub fn insert(&self, record: CallerRecord) {
        self.callers.insert(record.caller_id.clone(), record);
    }

    /// Remove a caller, returning the previous record.
    pub fn remove(&self, caller_id: &str) -> Option<CallerRecord> {
        self.callers.remove(caller_id).map(|(_, record)| record)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.callers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }
}

#[async_trait]
impl IdentityStore for StaticIdentityStore {
    async fn load_caller(&self, caller_id: &str) -> Result<Option<CallerRecord>, AuthError> {
        Ok(self.callers.get(caller_id).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::PermissionTier;
    use rowscope_core::OrganizationId;

    fn record(caller_id: &str, grants: &[&str]) -> CallerRecord {
        CallerRecord {
            caller_id: caller_id.to_string(),
            memberships: vec![OrganizationId::new(1)],
            practitioner_id: None,
            grants: grants.iter().map(|g| (*g).to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_static_store_roundtrip() {
        let store = StaticIdentityStore::new();
        store.insert(record("analyst", &["analytics:read:organization"]));
        assert_eq!(store.len(), 1);

        let context = store.caller_context("analyst").await.unwrap();
        assert_eq!(context.tier(), PermissionTier::OrganizationScoped);
        assert_eq!(context.memberships, vec![OrganizationId::new(1)]);
    }

    #[test]
    fn test_unknown_caller_is_denied() {
        let store = StaticIdentityStore::new();
        let context = tokio_test::block_on(store.caller_context("ghost")).unwrap();
        assert_eq!(context.tier(), PermissionTier::Denied);
        assert_eq!(context.caller_id, "ghost");
    }

    #[tokio::test]
    async fn test_malformed_grant_surfaces() {
        let store = StaticIdentityStore::new();
        store.insert(record("odd", &["analytics:read:region"]));
        let err = store.caller_context("odd").await.unwrap_err();
        assert!(err.is_access_denied());
    }

    #[test]
    fn test_remove() {
        let store = StaticIdentityStore::new();
        store.insert(record("a", &[]));
        assert!(store.remove("a").is_some());
        assert!(store.is_empty());
    }
}
