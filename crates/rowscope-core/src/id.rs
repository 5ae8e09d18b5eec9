//! Strongly typed identifiers.
//!
//! Organization, facility and practitioner identifiers are warehouse integer
//! keys. Wrapping them keeps a facility id from ever being passed where a
//! practitioner id is expected, which matters for a scoping engine where the
//! two are different row-level filter columns.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw warehouse key.
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// The raw warehouse key.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

integer_id!(
    /// Identifier of an organization node in the hierarchy.
    OrganizationId
);

integer_id!(
    /// Row-level scoping key for one organizational location.
    FacilityId
);

integer_id!(
    /// Row-level scoping key for one individual care provider.
    PractitionerId
);

/// Identifier of a warehouse data-source partition.
///
/// Warming, invalidation and health reporting are all keyed by data source.
/// The value is embedded in cache keys, so it is restricted to characters
/// that cannot collide with the key separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataSourceId(String);

impl DataSourceId {
    /// Create a data-source id, validating its characters.
    ///
    /// Allowed: ASCII alphanumerics, `-`, `_` and `.`.
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidDataSourceId> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.len() <= 128
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(Self(value))
        } else {
            Err(InvalidDataSourceId(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DataSourceId {
    type Error = InvalidDataSourceId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<DataSourceId> for String {
    fn from(value: DataSourceId) -> Self {
        value.0
    }
}

/// Rejected data-source identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid data source id: {0:?}")]
pub struct InvalidDataSourceId(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_ids_are_distinct_types() {
        let facility = FacilityId::new(3);
        let practitioner = PractitionerId::new(3);
        assert_eq!(facility.get(), practitioner.get());
        assert_eq!(facility.to_string(), "3");
    }

    #[test]
    fn test_integer_id_serializes_transparently() {
        let json = serde_json::to_string(&FacilityId::new(42)).unwrap();
        assert_eq!(json, "42");
        let back: FacilityId = serde_json::from_str("42").unwrap();
        assert_eq!(back, FacilityId::new(42));
    }

    #[test]
    fn test_data_source_validation() {
        assert!(DataSourceId::parse("claims_2024.v2").is_ok());
        assert!(DataSourceId::parse("").is_err());
        assert!(DataSourceId::parse("claims:prod").is_err());
        assert!(DataSourceId::parse("has space").is_err());
    }

    #[test]
    fn test_data_source_deserialize_rejects_separator() {
        let ok: DataSourceId = serde_json::from_str("\"encounters\"").unwrap();
        assert_eq!(ok.as_str(), "encounters");
        assert!(serde_json::from_str::<DataSourceId>("\"a:b\"").is_err());
    }
}
