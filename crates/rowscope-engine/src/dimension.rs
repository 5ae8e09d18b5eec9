//! Dimension keys and secondary-index terms.
//!
//! A [`DimensionKey`] names one precomputed analytics result: a measure over
//! a time range at a granularity, narrowed by optional tag equalities. Its
//! digest is the stable cache identity; its [`IndexTerm`]s feed the inverted
//! indices.

use std::collections::BTreeMap;
use std::fmt;

use rowscope_auth::{AnalyticsQuery, Predicate, ScopeColumns, SqlValue, validate_identifier};
use rowscope_core::{DataSourceId, FacilityId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::EngineError;
use crate::EngineResult;

/// Column holding the start of each time bucket in measure relations.
pub const BUCKET_COLUMN: &str = "bucket_start";

/// Column holding the measure value in measure relations.
pub const VALUE_COLUMN: &str = "value";

/// Column holding the bucket granularity in measure relations.
pub const GRANULARITY_COLUMN: &str = "granularity";

/// Time bucket size of a measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(with = "time::serde::timestamp")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub end: OffsetDateTime,
}

impl TimeRange {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self { start, end }
    }
}

/// Identity of one precomputed analytics result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionKey {
    pub data_source: DataSourceId,
    pub measure: String,
    pub granularity: Granularity,
    pub range: TimeRange,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl DimensionKey {
    pub fn new(
        data_source: DataSourceId,
        measure: impl Into<String>,
        granularity: Granularity,
        range: TimeRange,
    ) -> Self {
        Self {
            data_source,
            measure: measure.into(),
            granularity,
            range,
            tags: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    /// Check the key can be embedded in store keys and rendered as SQL.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidDimension` describing the first problem.
    pub fn validate(&self) -> EngineResult<()> {
        validate_identifier(&self.measure)
            .map_err(|_| EngineError::invalid_dimension(format!("measure {:?}", self.measure)))?;
        if self.range.start >= self.range.end {
            return Err(EngineError::invalid_dimension("time range is empty"));
        }
        for (name, value) in &self.tags {
            validate_identifier(name)
                .map_err(|_| EngineError::invalid_dimension(format!("tag name {name:?}")))?;
            if !is_term_safe(value) {
                return Err(EngineError::invalid_dimension(format!(
                    "tag {name} has value {value:?}"
                )));
            }
        }
        Ok(())
    }

    /// Stable hex digest of the key.
    ///
    /// Computed over the canonical JSON form: struct fields in declaration
    /// order, tags sorted by name.
    pub fn digest(&self) -> EngineResult<String> {
        let canonical = serde_json::to_vec(self).map_err(rowscope_core::CoreError::from)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Index terms derived from the key alone.
    pub fn terms(&self) -> Vec<IndexTerm> {
        let mut terms = Vec::with_capacity(2 + self.tags.len());
        terms.push(IndexTerm::measure(&self.measure));
        terms.push(IndexTerm::granularity(self.granularity));
        terms.extend(self.tags.iter().map(|(k, v)| IndexTerm::tag(k, v)));
        terms
    }

    /// Unscoped warehouse query for this key.
    ///
    /// The measure names the relation; scope predicates are added later by
    /// the filter injector.
    pub fn to_query(&self, columns: &ScopeColumns) -> AnalyticsQuery {
        let mut query = AnalyticsQuery::new(
            &self.measure,
            [
                BUCKET_COLUMN,
                columns.facility.as_str(),
                columns.practitioner.as_str(),
                VALUE_COLUMN,
            ],
        )
        .with_predicate(Predicate::equals(
            GRANULARITY_COLUMN,
            SqlValue::Text(self.granularity.as_str().to_string()),
        ))
        .with_predicate(Predicate::gte(
            BUCKET_COLUMN,
            SqlValue::Integer(self.range.start.unix_timestamp()),
        ))
        .with_predicate(Predicate::lt(
            BUCKET_COLUMN,
            SqlValue::Integer(self.range.end.unix_timestamp()),
        ));
        for (name, value) in &self.tags {
            query = query.with_predicate(Predicate::equals(name, SqlValue::Text(value.clone())));
        }
        query
    }
}

fn is_term_safe(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// =============================================================================
// Index Terms
// =============================================================================

/// One dimension value in the inverted index, e.g. `facility:3`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexTerm(String);

impl IndexTerm {
    pub const MEASURE_PREFIX: &'static str = "measure:";
    pub const FACILITY_PREFIX: &'static str = "facility:";

    pub fn measure(measure: &str) -> Self {
        Self(format!("{}{measure}", Self::MEASURE_PREFIX))
    }

    pub fn granularity(granularity: Granularity) -> Self {
        Self(format!("granularity:{granularity}"))
    }

    pub fn facility(facility: FacilityId) -> Self {
        Self(format!("{}{facility}", Self::FACILITY_PREFIX))
    }

    pub fn tag(name: &str, value: &str) -> Self {
        Self(format!("tag:{name}={value}"))
    }

    /// Rebuild a term read back from the term registry.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_measure(&self) -> bool {
        self.0.starts_with(Self::MEASURE_PREFIX)
    }

    pub fn is_facility(&self) -> bool {
        self.0.starts_with(Self::FACILITY_PREFIX)
    }
}

impl fmt::Display for IndexTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn key() -> DimensionKey {
        DimensionKey::new(
            DataSourceId::parse("claims").unwrap(),
            "encounter_volume",
            Granularity::Day,
            TimeRange::new(datetime!(2024-01-01 0:00 UTC), datetime!(2024-02-01 0:00 UTC)),
        )
    }

    #[test]
    fn test_digest_is_stable_and_tag_order_independent() {
        let a = key().with_tag("payer", "medicare").with_tag("region", "north");
        let b = key().with_tag("region", "north").with_tag("payer", "medicare");
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap().len(), 64);
        assert_ne!(a.digest().unwrap(), key().digest().unwrap());
    }

    #[test]
    fn test_validate() {
        assert!(key().validate().is_ok());

        let mut bad = key();
        bad.measure = "volume; DROP TABLE x".to_string();
        assert!(matches!(bad.validate(), Err(EngineError::InvalidDimension { .. })));

        let mut empty = key();
        empty.range.end = empty.range.start;
        assert!(empty.validate().is_err());

        assert!(key().with_tag("payer", "a:b").validate().is_err());
        assert!(key().with_tag("1payer", "x").validate().is_err());
    }

    #[test]
    fn test_terms() {
        let terms: Vec<String> = key()
            .with_tag("payer", "medicare")
            .terms()
            .into_iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(
            terms,
            vec![
                "measure:encounter_volume",
                "granularity:day",
                "tag:payer=medicare"
            ]
        );
        assert!(IndexTerm::facility(FacilityId::new(3)).is_facility());
        assert!(IndexTerm::measure("x").is_measure());
    }

    #[test]
    fn test_to_query_renders_parameters() {
        let built = key()
            .with_tag("payer", "medicare")
            .to_query(&ScopeColumns::default())
            .render()
            .unwrap();
        assert_eq!(
            built.sql,
            "SELECT bucket_start, facility_id, practitioner_id, value FROM encounter_volume \
             WHERE granularity = $1 AND bucket_start >= $2 AND bucket_start < $3 AND payer = $4"
        );
        assert_eq!(built.params.len(), 4);
        assert_eq!(built.params[3], SqlValue::Text("medicare".to_string()));
    }
}
