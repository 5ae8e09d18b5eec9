use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::id::{FacilityId, OrganizationId};

/// One node of the organization hierarchy as read from the identity store.
///
/// Organizations are edited by administrative tooling; the engine only ever
/// reads full snapshots of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: OrganizationId,
    #[serde(default)]
    pub parent_id: Option<OrganizationId>,
    /// Facilities owned directly by this organization (not by descendants).
    #[serde(default)]
    pub facilities: BTreeSet<FacilityId>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Organization {
    /// Create an active root organization without facilities.
    pub fn new(id: OrganizationId) -> Self {
        Self {
            id,
            parent_id: None,
            facilities: BTreeSet::new(),
            active: true,
        }
    }

    /// Set the parent organization.
    pub fn with_parent(mut self, parent_id: OrganizationId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Add directly owned facilities.
    pub fn with_facilities(mut self, facilities: impl IntoIterator<Item = FacilityId>) -> Self {
        self.facilities.extend(facilities);
        self
    }

    /// Mark the organization inactive.
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}
