//! Permission resolver.
//!
//! The single authority converting a [`CallerContext`] into an
//! [`EffectiveFilter`]. Tiers are evaluated in strict priority order and the
//! first match wins:
//!
//! 1. `analytics:read:all` returns [`EffectiveFilter::Unrestricted`] without
//!    touching the hierarchy.
//! 2. `analytics:read:organization` unions the facility sets of every
//!    membership's subtree. An empty union is deny-all.
//! 3. `analytics:read:own` returns the caller's practitioner id, or deny-all
//!    if the caller has none.
//! 4. Anything else is deny-all.
//!
//! A matched tier never falls through to a narrower one: an organization
//! grant whose union is empty denies even if the caller also holds a
//! practitioner grant.

use std::collections::BTreeSet;
use std::sync::Arc;

use rowscope_core::SharedHierarchy;

use crate::audit::{AuditSink, ResolutionAudit, ResolutionOutcome, TracingAuditSink};
use crate::context::CallerContext;
use crate::error::AuthError;
use crate::filter::EffectiveFilter;
use crate::grant::PermissionTier;
use crate::identity::IdentityStore;

/// Result type for resolution.
pub type ResolveResult<T> = crate::AuthResult<T>;

/// Resolves callers to effective filters against a shared hierarchy snapshot.
#[derive(Clone)]
pub struct PermissionResolver {
    hierarchy: Arc<SharedHierarchy>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for PermissionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionResolver")
            .field("hierarchy", &self.hierarchy)
            .finish_non_exhaustive()
    }
}

impl PermissionResolver {
    /// Create a resolver that audits through `tracing`.
    pub fn new(hierarchy: Arc<SharedHierarchy>) -> Self {
        Self::with_audit_sink(hierarchy, Arc::new(TracingAuditSink))
    }

    pub fn with_audit_sink(hierarchy: Arc<SharedHierarchy>, audit: Arc<dyn AuditSink>) -> Self {
        Self { hierarchy, audit }
    }

    pub fn hierarchy(&self) -> &Arc<SharedHierarchy> {
        &self.hierarchy
    }

    /// Resolve a caller to its effective filter.
    ///
    /// Deny-all is a normal return value here. Use
    /// [`PermissionResolver::resolve_or_deny`] to turn it into an error.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Hierarchy` if a membership's subtree is corrupt.
    /// The error is logged at error level; no partial union is returned.
    pub fn resolve(&self, caller: &CallerContext) -> ResolveResult<EffectiveFilter> {
        let tier = caller.tier();
        let result = match tier {
            PermissionTier::Unrestricted => Ok(EffectiveFilter::Unrestricted),
            PermissionTier::OrganizationScoped => self.organization_filter(caller),
            PermissionTier::PractitionerScoped => Ok(caller
                .practitioner_id
                .map_or(EffectiveFilter::DenyAll, EffectiveFilter::Practitioner)),
            PermissionTier::Denied => Ok(EffectiveFilter::DenyAll),
        };

        let (filter_size, outcome) = match &result {
            Ok(filter) => (filter.size(), outcome_of(filter)),
            Err(_) => (0, ResolutionOutcome::Error),
        };
        self.audit.record(&ResolutionAudit {
            caller_id: caller.caller_id.clone(),
            tier,
            membership_count: caller.memberships.len(),
            filter_size,
            outcome,
        });

        result
    }

    /// Resolve, mapping deny-all to `AuthError::Denied`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Denied` for deny-all, or any error from
    /// [`PermissionResolver::resolve`].
    pub fn resolve_or_deny(&self, caller: &CallerContext) -> ResolveResult<EffectiveFilter> {
        let filter = self.resolve(caller)?;
        if filter.is_deny_all() {
            return Err(AuthError::denied(&caller.caller_id));
        }
        Ok(filter)
    }

    /// Load a caller from the identity store and resolve it.
    ///
    /// A malformed analytics grant fails closed and is logged for admin
    /// review; it is audited like any other failed resolution.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::AmbiguousGrant`, identity store errors, or any
    /// error from [`PermissionResolver::resolve`].
    pub async fn resolve_caller(
        &self,
        identity: &dyn IdentityStore,
        caller_id: &str,
    ) -> ResolveResult<EffectiveFilter> {
        let caller = match identity.caller_context(caller_id).await {
            Ok(caller) => caller,
            Err(err @ AuthError::AmbiguousGrant { .. }) => {
                tracing::warn!(
                    caller_id = %caller_id,
                    error = %err,
                    "Caller holds an ambiguous analytics grant; denying"
                );
                self.audit.record(&ResolutionAudit {
                    caller_id: caller_id.to_string(),
                    tier: PermissionTier::Denied,
                    membership_count: 0,
                    filter_size: 0,
                    outcome: ResolutionOutcome::Error,
                });
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        self.resolve(&caller)
    }

    fn organization_filter(&self, caller: &CallerContext) -> ResolveResult<EffectiveFilter> {
        // One snapshot for the whole union, even if a refresh lands meanwhile.
        let snapshot = self.hierarchy.load();

        let mut facilities = BTreeSet::new();
        for &organization in &caller.memberships {
            let union = snapshot.index.facility_union(organization).map_err(|err| {
                tracing::error!(
                    caller_id = %caller.caller_id,
                    organization_id = %organization,
                    error = %err,
                    "Resolution aborted on corrupt organization hierarchy"
                );
                AuthError::from(err)
            })?;
            facilities.extend(union);
        }

        if facilities.is_empty() {
            tracing::warn!(
                caller_id = %caller.caller_id,
                memberships = caller.memberships.len(),
                hierarchy_version = snapshot.version,
                "Organization-scoped caller has no facilities; denying all rows"
            );
        }
        Ok(EffectiveFilter::facilities(facilities))
    }
}

fn outcome_of(filter: &EffectiveFilter) -> ResolutionOutcome {
    if filter.is_deny_all() {
        return ResolutionOutcome::DenyAll;
    }
    match filter {
        EffectiveFilter::Unrestricted => ResolutionOutcome::Unrestricted,
        EffectiveFilter::Facilities(_) => ResolutionOutcome::Facilities,
        EffectiveFilter::Practitioner(_) => ResolutionOutcome::Practitioner,
        EffectiveFilter::DenyAll => ResolutionOutcome::DenyAll,
    }
}
