//! Effective row filters and their in-memory application.
//!
//! An [`EffectiveFilter`] is the output of permission resolution. The same
//! value drives two enforcement points: the predicate appended to warehouse
//! queries (see [`crate::injector`]) and the re-filtering of cached payloads
//! before they are returned. Both must agree row for row, so the in-memory
//! semantics here mirror SQL three-valued logic:
//!
//! - `facility IN (set)` never matches a NULL facility
//! - `practitioner = id OR practitioner IS NULL` keeps unattributed rows

use std::collections::BTreeSet;
use std::fmt;

use rowscope_core::{FacilityId, PractitionerId, ResultSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AuthError;
use crate::injector::validate_identifier;

/// Default name of the facility scoping column.
pub const DEFAULT_FACILITY_COLUMN: &str = "facility_id";

/// Default name of the practitioner scoping column.
pub const DEFAULT_PRACTITIONER_COLUMN: &str = "practitioner_id";

/// The resolved, minimal row restriction for one caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EffectiveFilter {
    /// No restriction. Only produced for the unrestricted tier.
    Unrestricted,
    /// Rows whose facility is in the set. Never empty when built through
    /// [`EffectiveFilter::facilities`]; an empty set matches nothing.
    Facilities(BTreeSet<FacilityId>),
    /// Rows attributed to this practitioner, or not attributed at all.
    Practitioner(PractitionerId),
    /// Nothing.
    DenyAll,
}

impl EffectiveFilter {
    /// Facility filter for a computed union. An empty union is deny-all,
    /// never unrestricted.
    #[must_use]
    pub fn facilities(facilities: BTreeSet<FacilityId>) -> Self {
        if facilities.is_empty() {
            Self::DenyAll
        } else {
            Self::Facilities(facilities)
        }
    }

    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Unrestricted)
    }

    /// True for deny-all and for a facility filter with an empty set.
    #[must_use]
    pub fn is_deny_all(&self) -> bool {
        match self {
            Self::DenyAll => true,
            Self::Facilities(set) => set.is_empty(),
            _ => false,
        }
    }

    /// Number of filter values, for audit records. Unrestricted and deny-all
    /// both report 0.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Unrestricted | Self::DenyAll => 0,
            Self::Facilities(set) => set.len(),
            Self::Practitioner(_) => 1,
        }
    }

    /// Short kind label for logs and audit records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unrestricted => "unrestricted",
            Self::Facilities(_) => "facilities",
            Self::Practitioner(_) => "practitioner",
            Self::DenyAll => "deny_all",
        }
    }

    /// True if `self` admits every row `other` admits.
    ///
    /// Used to decide whether a cached result computed under `other` may be
    /// re-filtered down to `self`.
    #[must_use]
    pub fn covers(&self, other: &EffectiveFilter) -> bool {
        match (self, other) {
            (_, other) if other.is_deny_all() => true,
            (Self::Unrestricted, _) => true,
            (Self::Facilities(mine), Self::Facilities(theirs)) => theirs.is_subset(mine),
            (Self::Practitioner(mine), Self::Practitioner(theirs)) => mine == theirs,
            _ => false,
        }
    }

    /// Row-level check given the row's scoping values (`None` is SQL NULL).
    #[must_use]
    pub fn allows(&self, facility: Option<i64>, practitioner: Option<i64>) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Facilities(set) => {
                facility.is_some_and(|f| set.contains(&FacilityId::new(f)))
            }
            Self::Practitioner(id) => practitioner.is_none_or(|p| p == id.get()),
            Self::DenyAll => false,
        }
    }

    /// Drop every row of `result` this filter does not admit.
    ///
    /// A facility filter applied to a result without the facility column
    /// drops every row: scope cannot be verified, so nothing is returned.
    /// A missing practitioner column reads as NULL for every row, matching
    /// the "not attributable" branch of the practitioner predicate.
    ///
    /// Returns the number of rows removed.
    pub fn apply(&self, result: &mut ResultSet, columns: &ScopeColumns) -> usize {
        let before = result.len();
        match self {
            Self::Unrestricted => {}
            Self::DenyAll => result.rows.clear(),
            Self::Facilities(_) => match result.column_index(&columns.facility) {
                Some(idx) => result.retain_rows(|row| self.allows(integer(row, idx), None)),
                None => result.rows.clear(),
            },
            Self::Practitioner(_) => {
                if let Some(idx) = result.column_index(&columns.practitioner) {
                    result.retain_rows(|row| self.allows(None, integer(row, idx)));
                }
            }
        }
        before - result.len()
    }
}

fn integer(row: &[Value], idx: usize) -> Option<i64> {
    row.get(idx).and_then(Value::as_i64)
}

impl fmt::Display for EffectiveFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrestricted => write!(f, "unrestricted"),
            Self::Facilities(set) => {
                write!(f, "facilities[")?;
                for (i, id) in set.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{id}")?;
                }
                write!(f, "]")
            }
            Self::Practitioner(id) => write!(f, "practitioner[{id}]"),
            Self::DenyAll => write!(f, "deny_all"),
        }
    }
}

// =============================================================================
// Scope Columns
// =============================================================================

/// Names of the row-level scoping columns in the analytics dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeColumns {
    pub facility: String,
    pub practitioner: String,
}

impl Default for ScopeColumns {
    fn default() -> Self {
        Self {
            facility: DEFAULT_FACILITY_COLUMN.to_string(),
            practitioner: DEFAULT_PRACTITIONER_COLUMN.to_string(),
        }
    }
}

impl ScopeColumns {
    #[must_use]
    pub fn new(facility: impl Into<String>, practitioner: impl Into<String>) -> Self {
        Self {
            facility: facility.into(),
            practitioner: practitioner.into(),
        }
    }

    /// Check both names are plain SQL identifiers.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidIdentifier` for the first bad name.
    pub fn validate(&self) -> Result<(), AuthError> {
        validate_identifier(&self.facility)?;
        validate_identifier(&self.practitioner)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowscope_core::{ColumnSpec, ColumnType};
    use serde_json::json;

    fn facility_set(ids: &[i64]) -> BTreeSet<FacilityId> {
        ids.iter().copied().map(FacilityId::new).collect()
    }

    fn rows() -> ResultSet {
        let mut result = ResultSet::new(vec![
            ColumnSpec::new("facility_id", ColumnType::Integer),
            ColumnSpec::new("practitioner_id", ColumnType::Integer),
            ColumnSpec::new("visits", ColumnType::Integer),
        ]);
        for row in [
            vec![json!(1), json!(42), json!(10)],
            vec![json!(2), json!(43), json!(20)],
            vec![json!(3), Value::Null, json!(30)],
            vec![Value::Null, json!(42), json!(40)],
        ] {
            result.push_row(row).unwrap();
        }
        result
    }

    #[test]
    fn test_empty_union_is_deny_all() {
        assert_eq!(EffectiveFilter::facilities(BTreeSet::new()), EffectiveFilter::DenyAll);
        assert!(EffectiveFilter::Facilities(BTreeSet::new()).is_deny_all());
        assert!(!EffectiveFilter::Unrestricted.is_deny_all());
    }

    #[test]
    fn test_facility_filter_excludes_null_facility() {
        let filter = EffectiveFilter::facilities(facility_set(&[1, 3]));
        let mut result = rows();
        let removed = filter.apply(&mut result, &ScopeColumns::default());
        assert_eq!(removed, 2);
        assert_eq!(result.distinct_integers("facility_id"), vec![1, 3]);
    }

    #[test]
    fn test_practitioner_filter_keeps_unattributed_rows() {
        let filter = EffectiveFilter::Practitioner(PractitionerId::new(42));
        let mut result = rows();
        filter.apply(&mut result, &ScopeColumns::default());
        assert_eq!(result.len(), 3);
        assert!(
            result
                .distinct_integers("practitioner_id")
                .iter()
                .all(|p| *p == 42)
        );
    }

    #[test]
    fn test_missing_facility_column_drops_everything() {
        let filter = EffectiveFilter::facilities(facility_set(&[1]));
        let mut result = ResultSet::new(vec![ColumnSpec::new("visits", ColumnType::Integer)])
            .with_row(vec![json!(7)])
            .unwrap();
        filter.apply(&mut result, &ScopeColumns::default());
        assert!(result.is_empty());
    }

    #[test]
    fn test_deny_all_and_unrestricted() {
        let mut result = rows();
        EffectiveFilter::Unrestricted.apply(&mut result, &ScopeColumns::default());
        assert_eq!(result.len(), 4);
        EffectiveFilter::DenyAll.apply(&mut result, &ScopeColumns::default());
        assert!(result.is_empty());
    }

    #[test]
    fn test_covers() {
        let broad = EffectiveFilter::facilities(facility_set(&[1, 2, 3]));
        let narrow = EffectiveFilter::facilities(facility_set(&[3]));
        assert!(EffectiveFilter::Unrestricted.covers(&broad));
        assert!(broad.covers(&narrow));
        assert!(!narrow.covers(&broad));
        assert!(!broad.covers(&EffectiveFilter::Unrestricted));
        assert!(!broad.covers(&EffectiveFilter::Practitioner(PractitionerId::new(1))));
        assert!(narrow.covers(&EffectiveFilter::DenyAll));
    }

    #[test]
    fn test_display() {
        let filter = EffectiveFilter::facilities(facility_set(&[3, 1]));
        assert_eq!(filter.to_string(), "facilities[1,3]");
        assert_eq!(filter.size(), 2);
        assert_eq!(filter.kind(), "facilities");
    }

    #[test]
    fn test_scope_columns_validation() {
        assert!(ScopeColumns::default().validate().is_ok());
        assert!(ScopeColumns::new("facility_id; drop", "p").validate().is_err());
    }
}
