//! Caller authorization context.

use std::collections::BTreeSet;

use rowscope_core::{OrganizationId, PractitionerId};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::grant::{AnalyticsGrant, PermissionTier, parse_grants};

/// Raw caller record as stored by the identity/role store.
///
/// Grants are kept as strings here; they are only trusted once
/// [`CallerRecord::into_context`] has parsed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerRecord {
    pub caller_id: String,
    #[serde(default)]
    pub memberships: Vec<OrganizationId>,
    #[serde(default)]
    pub practitioner_id: Option<PractitionerId>,
    #[serde(default)]
    pub grants: Vec<String>,
}

impl CallerRecord {
    /// Parse the stored grants into an authorization context.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::AmbiguousGrant` if any analytics grant is malformed.
    pub fn into_context(self) -> Result<CallerContext, AuthError> {
        let grants = parse_grants(&self.grants)
            .map_err(|unknown| AuthError::ambiguous_grant(&self.caller_id, unknown.0))?;
        Ok(CallerContext {
            caller_id: self.caller_id,
            memberships: self.memberships,
            practitioner_id: self.practitioner_id,
            grants,
        })
    }
}

/// Everything the resolver needs to know about one caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub caller_id: String,
    pub memberships: Vec<OrganizationId>,
    pub practitioner_id: Option<PractitionerId>,
    pub grants: BTreeSet<AnalyticsGrant>,
}

impl CallerContext {
    /// A caller with no memberships and no grants (denied).
    #[must_use]
    pub fn new(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            memberships: Vec::new(),
            practitioner_id: None,
            grants: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_grant(mut self, grant: AnalyticsGrant) -> Self {
        self.grants.insert(grant);
        self
    }

    #[must_use]
    pub fn with_membership(mut self, organization: OrganizationId) -> Self {
        self.memberships.push(organization);
        self
    }

    #[must_use]
    pub fn with_practitioner(mut self, practitioner: PractitionerId) -> Self {
        self.practitioner_id = Some(practitioner);
        self
    }

    /// The derived permission tier.
    #[must_use]
    pub fn tier(&self) -> PermissionTier {
        PermissionTier::from_grants(&self.grants)
    }
}
