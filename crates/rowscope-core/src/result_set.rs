//! Opaque row collections returned by the warehouse.
//!
//! The engine never interprets measure values. It only needs to locate the
//! scoping columns (facility, practitioner) to re-filter rows, and to
//! serialize the payload byte-for-byte into the cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Declared type of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Boolean,
    Timestamp,
    Json,
}

/// Column name and type, supplied by the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// A warehouse result: a stable schema plus positional rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// An empty result with the given schema.
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidResultSet` if the row width does not match
    /// the schema.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(CoreError::invalid_result_set(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Builder form of [`ResultSet::push_row`].
    ///
    /// # Errors
    ///
    /// Same as [`ResultSet::push_row`].
    pub fn with_row(mut self, row: Vec<Value>) -> Result<Self> {
        self.push_row(row)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Integer value of `column` in `row`, `None` for SQL NULL or a missing
    /// column.
    pub fn integer_at(&self, row: usize, column: usize) -> Option<i64> {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .and_then(Value::as_i64)
    }

    /// Distinct non-null integer values of a column, in row order.
    pub fn distinct_integers(&self, column: &str) -> Vec<i64> {
        let Some(idx) = self.column_index(column) else {
            return Vec::new();
        };
        let mut seen = std::collections::BTreeSet::new();
        self.rows
            .iter()
            .filter_map(|row| row.get(idx).and_then(Value::as_i64))
            .filter(|v| seen.insert(*v))
            .collect()
    }

    /// Keep the rows for which `keep(row)` is true.
    pub fn retain_rows(&mut self, mut keep: impl FnMut(&[Value]) -> bool) {
        self.rows.retain(|row| keep(row));
    }

    /// Check that every row matches the schema width.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidResultSet` for the first mismatching row.
    pub fn validate(&self) -> Result<()> {
        for (idx, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(CoreError::invalid_result_set(format!(
                    "row {idx} has {} values, schema has {} columns",
                    row.len(),
                    self.columns.len()
                )));
            }
        }
        Ok(())
    }

    /// Serialize to the byte form stored in the cache.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::JsonError` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Inverse of [`ResultSet::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::JsonError` for malformed bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let result: Self = serde_json::from_slice(bytes)?;
        result.validate()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("facility_id", ColumnType::Integer),
            ColumnSpec::new("practitioner_id", ColumnType::Integer),
            ColumnSpec::new("visits", ColumnType::Integer),
        ]
    }

    #[test]
    fn test_push_row_checks_width() {
        let mut result = ResultSet::new(schema());
        assert!(result.push_row(vec![json!(1), json!(2), json!(3)]).is_ok());
        assert!(result.push_row(vec![json!(1)]).is_err());
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_distinct_integers_skips_nulls() {
        let result = ResultSet::new(schema())
            .with_row(vec![json!(1), json!(42), json!(3)])
            .unwrap()
            .with_row(vec![json!(2), Value::Null, json!(5)])
            .unwrap()
            .with_row(vec![json!(1), json!(43), json!(1)])
            .unwrap();

        assert_eq!(result.distinct_integers("facility_id"), vec![1, 2]);
        assert_eq!(result.distinct_integers("practitioner_id"), vec![42, 43]);
        assert!(result.distinct_integers("missing").is_empty());
        assert_eq!(result.integer_at(1, 1), None);
    }

    #[test]
    fn test_retain_rows() {
        let mut result = ResultSet::new(schema())
            .with_row(vec![json!(1), json!(42), json!(3)])
            .unwrap()
            .with_row(vec![json!(2), json!(43), json!(5)])
            .unwrap();
        result.retain_rows(|row| row[0] == json!(2));
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_from_bytes_rejects_ragged_rows() {
        let bytes = br#"{"columns":[{"name":"a","type":"integer"}],"rows":[[1,2]]}"#;
        assert!(ResultSet::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_empty_result_survives_bytes() {
        let result = ResultSet::new(schema());
        let bytes = result.to_bytes().unwrap();
        let back = ResultSet::from_bytes(&bytes).unwrap();
        assert!(back.is_empty());
        assert_eq!(back.columns.len(), 3);
    }
}
