//! Analytics grants and the permission tiers derived from them.
//!
//! Grants arrive from the identity store as strings of the form
//! `analytics:read:<level>`. They are parsed into a closed enumeration whose
//! declaration order is the resolution priority, so "broadest explicit grant
//! wins" is a plain `min()` over the held grants.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Namespace prefix shared by every analytics grant.
pub const ANALYTICS_GRANT_PREFIX: &str = "analytics:";

// =============================================================================
// Analytics Grant
// =============================================================================

/// A read grant over the analytics dataset.
///
/// Ordered by priority: `ReadAll < ReadOrganization < ReadOwn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AnalyticsGrant {
    /// `analytics:read:all`
    ReadAll,
    /// `analytics:read:organization`
    ReadOrganization,
    /// `analytics:read:own`
    ReadOwn,
}

impl AnalyticsGrant {
    /// Canonical grant string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadAll => "analytics:read:all",
            Self::ReadOrganization => "analytics:read:organization",
            Self::ReadOwn => "analytics:read:own",
        }
    }

    /// Tier this grant confers when it is the highest-priority grant held.
    #[must_use]
    pub const fn tier(self) -> PermissionTier {
        match self {
            Self::ReadAll => PermissionTier::Unrestricted,
            Self::ReadOrganization => PermissionTier::OrganizationScoped,
            Self::ReadOwn => PermissionTier::PractitionerScoped,
        }
    }
}

impl fmt::Display for AnalyticsGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A string in the analytics namespace that is not a known grant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown analytics grant: {0:?}")]
pub struct UnknownGrant(pub String);

impl FromStr for AnalyticsGrant {
    type Err = UnknownGrant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analytics:read:all" => Ok(Self::ReadAll),
            "analytics:read:organization" => Ok(Self::ReadOrganization),
            "analytics:read:own" => Ok(Self::ReadOwn),
            other => Err(UnknownGrant(other.to_string())),
        }
    }
}

impl TryFrom<String> for AnalyticsGrant {
    type Error = UnknownGrant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AnalyticsGrant> for String {
    fn from(value: AnalyticsGrant) -> Self {
        value.as_str().to_string()
    }
}

/// Extract the analytics grants from a caller's raw role grants.
///
/// Grants outside the `analytics:` namespace belong to other subsystems and
/// are skipped. A string inside the namespace that does not parse is an
/// error: the caller's intent is unclear and resolution must fail closed.
///
/// # Errors
///
/// Returns the first unparseable analytics grant.
pub fn parse_grants<I, S>(raw: I) -> Result<BTreeSet<AnalyticsGrant>, UnknownGrant>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut grants = BTreeSet::new();
    for grant in raw {
        let grant = grant.as_ref().trim();
        if !grant.starts_with(ANALYTICS_GRANT_PREFIX) {
            continue;
        }
        grants.insert(grant.parse()?);
    }
    Ok(grants)
}

// =============================================================================
// Permission Tier
// =============================================================================

/// Resolved authorization tier. Derived from grants, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionTier {
    Unrestricted,
    OrganizationScoped,
    PractitionerScoped,
    Denied,
}

impl PermissionTier {
    /// Tier for a set of grants: the highest-priority grant wins, no grant
    /// means denied.
    #[must_use]
    pub fn from_grants(grants: &BTreeSet<AnalyticsGrant>) -> Self {
        grants
            .iter()
            .next()
            .map_or(Self::Denied, |grant| grant.tier())
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unrestricted => "unrestricted",
            Self::OrganizationScoped => "organization-scoped",
            Self::PractitionerScoped => "practitioner-scoped",
            Self::Denied => "denied",
        }
    }
}

impl fmt::Display for PermissionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
