use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A typed destination cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Int64(i) => i.to_string(),
            Value::Float64(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Date(d) => d.format(DATE_FORMAT).to_string(),
            Value::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// Renders the cell the way a line-delimited JSON load expects it.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Int64(i) => JsonValue::from(*i),
            Value::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Date(_) | Value::Timestamp(_) => JsonValue::String(self.as_display()),
        }
    }

    /// Identity used for key comparison; `None` for null keys, which never match.
    pub fn key_string(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.as_display()),
        }
    }
}

/// A destination row in column order.
pub type Row = Vec<Value>;

/// Transformed rows of one chunk, all sharing the same ordered column list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Builds the JSON object for `row`, keyed by column name in column order.
    pub fn json_object(&self, row: &Row) -> serde_json::Map<String, JsonValue> {
        self.columns
            .iter()
            .zip(row.iter())
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            other => f.write_str(&other.as_display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_json_renders_dates_as_strings() {
        let date = NaiveDate::from_ymd_opt(2023, 4, 1).unwrap();
        assert_eq!(Value::Date(date).to_json(), JsonValue::from("2023-04-01"));
        let ts = date.and_hms_opt(9, 5, 0).unwrap();
        assert_eq!(
            Value::Timestamp(ts).to_json(),
            JsonValue::from("2023-04-01 09:05:00")
        );
    }

    #[test]
    fn to_json_keeps_numbers_numeric() {
        assert_eq!(Value::Int64(1234).to_json(), JsonValue::from(1234));
        assert_eq!(Value::Float64(12.5).to_json(), JsonValue::from(12.5));
        assert_eq!(Value::Float64(f64::NAN).to_json(), JsonValue::Null);
        assert_eq!(Value::Null.to_json(), JsonValue::Null);
    }

    #[test]
    fn json_object_keeps_column_order() {
        let mut batch = RowBatch::new(vec!["z".into(), "a".into()]);
        batch.rows.push(vec![Value::Int64(1), Value::Null]);
        let object = batch.json_object(&batch.rows[0]);
        let keys = object.keys().cloned().collect::<Vec<_>>();
        assert_eq!(keys, vec!["z", "a"]);
        assert_eq!(
            serde_json::to_string(&object).unwrap(),
            r#"{"z":1,"a":null}"#
        );
    }

    #[test]
    fn key_string_is_none_for_null() {
        assert_eq!(Value::Null.key_string(), None);
        assert_eq!(Value::Int64(7).key_string().as_deref(), Some("7"));
        assert_eq!(Value::Text("A-1".into()).key_string().as_deref(), Some("A-1"));
    }
}
