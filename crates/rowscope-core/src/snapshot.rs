//! Shared, periodically refreshed hierarchy snapshot.
//!
//! Resolutions read the current [`HierarchySnapshot`] through an `ArcSwap`
//! (lock-free) and keep that `Arc` for their whole run, so a refresh that
//! lands mid-resolution never changes the tree a resolution is looking at.
//!
//! # Example
//!
//! ```ignore
//! use rowscope_core::snapshot::SharedHierarchy;
//! use std::time::Duration;
//!
//! let shared = SharedHierarchy::new(Duration::from_secs(300));
//! shared.refresh(&organization_source).await?;
//!
//! let snapshot = shared.load();
//! let facilities = snapshot.index.facility_union(org_id)?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::Result;
use crate::hierarchy::HierarchyIndex;
use crate::organization::Organization;

/// Source of full organization snapshots (the identity/role store).
#[async_trait]
pub trait OrganizationSource: Send + Sync {
    /// Load every organization record.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Source` when the backing store cannot be read.
    async fn load_organizations(&self) -> Result<Vec<Organization>>;
}

/// One immutable generation of the hierarchy.
#[derive(Debug)]
pub struct HierarchySnapshot {
    pub index: HierarchyIndex,
    pub loaded_at: OffsetDateTime,
    /// Incremented on each successful refresh; 0 is the initial empty snapshot.
    pub version: u64,
}

/// Holder of the current hierarchy snapshot.
pub struct SharedHierarchy {
    current: ArcSwap<HierarchySnapshot>,
    refresh_interval: Duration,
}

impl std::fmt::Debug for SharedHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.current.load();
        f.debug_struct("SharedHierarchy")
            .field("version", &current.version)
            .field("organizations", &current.index.len())
            .field("loaded_at", &current.loaded_at)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

impl SharedHierarchy {
    /// Create a holder with an empty snapshot (every lookup fails closed).
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            current: ArcSwap::from_pointee(HierarchySnapshot {
                index: HierarchyIndex::empty(),
                loaded_at: OffsetDateTime::UNIX_EPOCH,
                version: 0,
            }),
            refresh_interval,
        }
    }

    /// Create a holder around an already built index.
    pub fn from_index(index: HierarchyIndex, refresh_interval: Duration) -> Self {
        let shared = Self::new(refresh_interval);
        shared.replace(index);
        shared
    }

    /// Current snapshot. Hold on to the returned `Arc` for the duration of a
    /// resolution.
    pub fn load(&self) -> Arc<HierarchySnapshot> {
        self.current.load_full()
    }

    /// Atomically publish a new index.
    pub fn replace(&self, index: HierarchyIndex) -> Arc<HierarchySnapshot> {
        let version = self.current.load().version + 1;
        let snapshot = Arc::new(HierarchySnapshot {
            index,
            loaded_at: OffsetDateTime::now_utc(),
            version,
        });
        self.current.store(Arc::clone(&snapshot));
        snapshot
    }

    /// Reload from the source and publish the result.
    ///
    /// Corruption found by [`HierarchyIndex::validate`] is logged at error
    /// level but does not block the refresh: traversal fails closed on the
    /// affected subtrees.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails or the snapshot contains
    /// duplicate organization ids. The previous snapshot stays in place.
    pub async fn refresh(&self, source: &dyn OrganizationSource) -> Result<Arc<HierarchySnapshot>> {
        let organizations = source.load_organizations().await?;
        let index = HierarchyIndex::build(organizations)?;

        for issue in index.validate() {
            tracing::error!(error = %issue, "Corrupt organization hierarchy in snapshot");
        }

        let snapshot = self.replace(index);
        tracing::info!(
            organizations = snapshot.index.len(),
            version = snapshot.version,
            "Hierarchy snapshot refreshed"
        );
        Ok(snapshot)
    }

    /// Refresh only if the current snapshot is older than the refresh interval.
    ///
    /// # Errors
    ///
    /// Same as [`SharedHierarchy::refresh`].
    pub async fn refresh_if_stale(
        &self,
        source: &dyn OrganizationSource,
    ) -> Result<Arc<HierarchySnapshot>> {
        if self.is_stale() {
            self.refresh(source).await
        } else {
            Ok(self.load())
        }
    }

    /// Check if the current snapshot has outlived the refresh interval.
    pub fn is_stale(&self) -> bool {
        let loaded_at = self.current.load().loaded_at;
        loaded_at + self.refresh_interval < OffsetDateTime::now_utc()
    }
}
