//! Filter injection into warehouse queries.
//!
//! Queries are kept as structured predicate lists until the last moment and
//! rendered with positional parameters (`$1`, `$2`, ...). Values never reach
//! the SQL text, and identifiers are validated against a strict pattern, so
//! neither caller-supplied predicates nor filter values can inject SQL.
//!
//! The scope predicate is always ANDed onto the caller's predicates. A caller
//! predicate can narrow the result further but never widen it.
//!
//! # Example
//!
//! ```ignore
//! use rowscope_auth::injector::{AnalyticsQuery, FilterInjector, Predicate, SqlValue};
//!
//! let injector = FilterInjector::new(ScopeColumns::default());
//! let query = AnalyticsQuery::new("encounters", ["facility_id", "visits"])
//!     .with_predicate(Predicate::gte("period_start", SqlValue::Integer(1_700_000_000)));
//!
//! let scoped = injector.scope_query(query, &filter);
//! let built = scoped.render()?;
//! // built.sql: SELECT facility_id, visits FROM encounters
//! //            WHERE period_start >= $1 AND facility_id IN ($2, $3)
//! ```

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AuthError;
use crate::filter::{EffectiveFilter, ScopeColumns};

/// Check that a table or column name is a plain SQL identifier, optionally
/// schema-qualified (`schema.table`).
///
/// # Errors
///
/// Returns `AuthError::InvalidIdentifier` otherwise.
pub fn validate_identifier(identifier: &str) -> Result<(), AuthError> {
    let valid = !identifier.is_empty()
        && identifier.len() <= 127
        && identifier.split('.').count() <= 2
        && identifier.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(AuthError::invalid_identifier(identifier))
    }
}

// =============================================================================
// Predicates
// =============================================================================

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
}

impl SqlValue {
    /// Compare against a row value. `None` when incomparable or NULL.
    fn compare(&self, value: &Value) -> Option<std::cmp::Ordering> {
        match self {
            Self::Integer(expected) => value.as_i64().map(|v| v.cmp(expected)),
            Self::Float(expected) => value.as_f64().and_then(|v| v.partial_cmp(expected)),
            Self::Text(expected) => value.as_str().map(|v| v.cmp(expected.as_str())),
            Self::Boolean(expected) => value.as_bool().map(|v| v.cmp(expected)),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Self::Eq => ordering == Equal,
            Self::NotEq => ordering != Equal,
            Self::Lt => ordering == Less,
            Self::Lte => ordering != Greater,
            Self::Gt => ordering == Greater,
            Self::Gte => ordering != Less,
        }
    }
}

/// One conjunct of a query's WHERE clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// `column <op> $n`
    Compare {
        column: String,
        op: CompareOp,
        value: SqlValue,
    },
    /// `column IN ($n, ...)`. An empty set matches nothing.
    InSet { column: String, values: Vec<SqlValue> },
    /// `column IS NULL`
    IsNull { column: String },
    /// Disjunction of its members. Empty matches nothing.
    Any { predicates: Vec<Predicate> },
    /// Matches no row.
    Never,
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: CompareOp, value: SqlValue) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value,
        }
    }

    pub fn equals(column: impl Into<String>, value: SqlValue) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn gte(column: impl Into<String>, value: SqlValue) -> Self {
        Self::compare(column, CompareOp::Gte, value)
    }

    pub fn lt(column: impl Into<String>, value: SqlValue) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn in_set(column: impl Into<String>, values: Vec<SqlValue>) -> Self {
        Self::InSet {
            column: column.into(),
            values,
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull {
            column: column.into(),
        }
    }

    pub fn any(predicates: Vec<Predicate>) -> Self {
        Self::Any { predicates }
    }

    /// Evaluate against one row. `lookup` returns the row value of a column,
    /// `None` for a column the row does not have (read as NULL).
    ///
    /// Follows SQL semantics: comparisons with NULL are false.
    pub fn matches<'a>(&self, lookup: &impl Fn(&str) -> Option<&'a Value>) -> bool {
        match self {
            Self::Compare { column, op, value } => lookup(column.as_str())
                .filter(|v| !v.is_null())
                .and_then(|v| value.compare(v))
                .is_some_and(|ordering| op.holds(ordering)),
            Self::InSet { column, values } => lookup(column.as_str())
                .filter(|v| !v.is_null())
                .is_some_and(|v| {
                    values
                        .iter()
                        .any(|candidate| candidate.compare(v) == Some(std::cmp::Ordering::Equal))
                }),
            Self::IsNull { column } => lookup(column.as_str()).is_none_or(Value::is_null),
            Self::Any { predicates } => predicates.iter().any(|p| p.matches(lookup)),
            Self::Never => false,
        }
    }

    fn render(&self, sql: &mut String, params: &mut Vec<SqlValue>) -> Result<(), AuthError> {
        match self {
            Self::Compare { column, op, value } => {
                validate_identifier(column)?;
                params.push(value.clone());
                let _ = write!(sql, "{column} {} ${}", op.as_sql(), params.len());
            }
            Self::InSet { column, values } => {
                validate_identifier(column)?;
                if values.is_empty() {
                    sql.push_str("FALSE");
                    return Ok(());
                }
                let _ = write!(sql, "{column} IN (");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    params.push(value.clone());
                    let _ = write!(sql, "${}", params.len());
                }
                sql.push(')');
            }
            Self::IsNull { column } => {
                validate_identifier(column)?;
                let _ = write!(sql, "{column} IS NULL");
            }
            Self::Any { predicates } => {
                if predicates.is_empty() {
                    sql.push_str("FALSE");
                    return Ok(());
                }
                sql.push('(');
                for (i, predicate) in predicates.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(" OR ");
                    }
                    predicate.render(sql, params)?;
                }
                sql.push(')');
            }
            Self::Never => sql.push_str("FALSE"),
        }
        Ok(())
    }
}

// =============================================================================
// Queries
// =============================================================================

/// A single-relation analytics read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsQuery {
    pub relation: String,
    pub projection: Vec<String>,
    pub predicates: Vec<Predicate>,
}

/// Rendered SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl AnalyticsQuery {
    pub fn new<I, S>(relation: impl Into<String>, projection: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            relation: relation.into(),
            projection: projection.into_iter().map(Into::into).collect(),
            predicates: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// True if the query can only return zero rows and need not be executed.
    pub fn is_short_circuited(&self) -> bool {
        self.predicates.iter().any(|p| matches!(p, Predicate::Never))
    }

    /// Evaluate the WHERE clause against one row of a relation.
    pub fn matches_row<'a>(&self, lookup: &impl Fn(&str) -> Option<&'a Value>) -> bool {
        self.predicates.iter().all(|p| p.matches(lookup))
    }

    /// Render to parameterized SQL.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidIdentifier` for a bad relation or column
    /// name, `AuthError::InvalidQuery` for an empty projection.
    pub fn render(&self) -> Result<BuiltQuery, AuthError> {
        validate_identifier(&self.relation)?;
        if self.projection.is_empty() {
            return Err(AuthError::invalid_query("projection is empty"));
        }
        for column in &self.projection {
            validate_identifier(column)?;
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            self.projection.join(", "),
            self.relation
        );
        let mut params = Vec::new();
        for (i, predicate) in self.predicates.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            predicate.render(&mut sql, &mut params)?;
        }
        Ok(BuiltQuery { sql, params })
    }
}

// =============================================================================
// Filter Injector
// =============================================================================

/// Merges an [`EffectiveFilter`] into outgoing queries.
#[derive(Debug, Clone, Default)]
pub struct FilterInjector {
    columns: ScopeColumns,
}

impl FilterInjector {
    pub fn new(columns: ScopeColumns) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &ScopeColumns {
        &self.columns
    }

    /// Produce the scoped predicate list for `base`.
    ///
    /// - unrestricted: `base` unchanged
    /// - facilities: `base AND facility IN (...)`
    /// - practitioner: `base AND (practitioner = $n OR practitioner IS NULL)`
    /// - deny-all: `[Never]`; the caller's predicates are discarded
    pub fn inject(&self, base: Vec<Predicate>, filter: &EffectiveFilter) -> Vec<Predicate> {
        if filter.is_deny_all() {
            return vec![Predicate::Never];
        }

        let mut predicates = base;
        match filter {
            EffectiveFilter::Unrestricted | EffectiveFilter::DenyAll => {}
            EffectiveFilter::Facilities(set) => predicates.push(Predicate::in_set(
                &self.columns.facility,
                set.iter().map(|f| SqlValue::Integer(f.get())).collect(),
            )),
            EffectiveFilter::Practitioner(id) => predicates.push(Predicate::any(vec![
                Predicate::equals(&self.columns.practitioner, SqlValue::Integer(id.get())),
                Predicate::is_null(&self.columns.practitioner),
            ])),
        }
        predicates
    }

    /// [`FilterInjector::inject`] applied to a whole query.
    pub fn scope_query(&self, query: AnalyticsQuery, filter: &EffectiveFilter) -> AnalyticsQuery {
        let AnalyticsQuery {
            relation,
            projection,
            predicates,
        } = query;
        AnalyticsQuery {
            relation,
            projection,
            predicates: self.inject(predicates, filter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowscope_core::{FacilityId, PractitionerId};
    use serde_json::json;
    use std::collections::{BTreeSet, HashMap};

    fn base_query() -> AnalyticsQuery {
        AnalyticsQuery::new("encounters", ["facility_id", "practitioner_id", "visits"])
            .with_predicate(Predicate::gte("period_start", SqlValue::Integer(100)))
    }

    fn facilities(ids: &[i64]) -> EffectiveFilter {
        EffectiveFilter::facilities(ids.iter().copied().map(FacilityId::new).collect())
    }

    #[test]
    fn test_unrestricted_leaves_predicates_unchanged() {
        let injector = FilterInjector::default();
        let base = base_query().predicates;
        assert_eq!(injector.inject(base.clone(), &EffectiveFilter::Unrestricted), base);
    }

    #[test]
    fn test_facility_filter_is_parameterized() {
        let injector = FilterInjector::default();
        let built = injector
            .scope_query(base_query(), &facilities(&[2, 1]))
            .render()
            .unwrap();

        assert_eq!(
            built.sql,
            "SELECT facility_id, practitioner_id, visits FROM encounters \
             WHERE period_start >= $1 AND facility_id IN ($2, $3)"
        );
        assert_eq!(
            built.params,
            vec![SqlValue::Integer(100), SqlValue::Integer(1), SqlValue::Integer(2)]
        );
    }

    #[test]
    fn test_practitioner_filter_allows_null() {
        let injector = FilterInjector::default();
        let filter = EffectiveFilter::Practitioner(PractitionerId::new(42));
        let built = injector.scope_query(base_query(), &filter).render().unwrap();

        assert!(
            built
                .sql
                .ends_with("AND (practitioner_id = $2 OR practitioner_id IS NULL)")
        );
        assert_eq!(built.params[1], SqlValue::Integer(42));
    }

    #[test]
    fn test_deny_all_short_circuits() {
        let injector = FilterInjector::default();
        let scoped = injector.scope_query(base_query(), &EffectiveFilter::DenyAll);
        assert!(scoped.is_short_circuited());
        assert_eq!(scoped.predicates, vec![Predicate::Never]);

        let empty = EffectiveFilter::Facilities(BTreeSet::new());
        assert!(injector.scope_query(base_query(), &empty).is_short_circuited());
    }

    #[test]
    fn test_caller_predicate_cannot_widen_scope() {
        // A caller trying to OR in another facility is still ANDed with the scope.
        let injector = FilterInjector::default();
        let sneaky = AnalyticsQuery::new("encounters", ["facility_id"]).with_predicate(
            Predicate::any(vec![
                Predicate::equals("facility_id", SqlValue::Integer(99)),
                Predicate::is_null("facility_id"),
            ]),
        );
        let scoped = injector.scope_query(sneaky, &facilities(&[1]));

        let row: HashMap<&str, Value> = [("facility_id", json!(99))].into_iter().collect();
        assert!(!scoped.matches_row(&|c: &str| row.get(c)));
    }

    #[test]
    fn test_malicious_values_stay_out_of_sql() {
        let query = AnalyticsQuery::new("encounters", ["visits"]).with_predicate(Predicate::equals(
            "measure",
            SqlValue::Text("x'; DROP TABLE encounters; --".to_string()),
        ));
        let built = query.render().unwrap();
        assert!(!built.sql.contains("DROP"));
        assert_eq!(built.params.len(), 1);
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        let query = AnalyticsQuery::new("encounters; --", ["visits"]);
        assert!(matches!(query.render(), Err(AuthError::InvalidIdentifier { .. })));

        let query = AnalyticsQuery::new("encounters", ["visits"])
            .with_predicate(Predicate::is_null("a b"));
        assert!(query.render().is_err());

        assert!(validate_identifier("analytics.encounters").is_ok());
        assert!(validate_identifier("a.b.c").is_err());
        assert!(validate_identifier("1abc").is_err());
    }

    #[test]
    fn test_predicate_null_semantics() {
        let null_row: HashMap<&str, Value> =
            [("practitioner_id", Value::Null)].into_iter().collect();
        let lookup = |c: &str| null_row.get(c);

        assert!(!Predicate::equals("practitioner_id", SqlValue::Integer(42)).matches(&lookup));
        assert!(Predicate::is_null("practitioner_id").matches(&lookup));
        assert!(Predicate::is_null("missing").matches(&lookup));
        assert!(!Predicate::in_set("practitioner_id", Vec::new()).matches(&lookup));
        assert!(
            !Predicate::compare("practitioner_id", CompareOp::NotEq, SqlValue::Integer(1))
                .matches(&lookup)
        );
    }
}
