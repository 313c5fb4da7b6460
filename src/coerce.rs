//! Type Coercion Engine.
//!
//! Converts raw string cells into typed [`Value`]s according to the destination
//! field type. Coercion never fails a row: a value that cannot be parsed is
//! reported as a [`CoercionWarning`] and loaded as null.

use std::{collections::BTreeMap, fmt, sync::OnceLock};

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use itertools::Itertools;
use log::warn;
use regex::Regex;

use crate::{
    mapping::{ColumnMapping, MappedColumns},
    schema::{FieldType, ResolvedSchema},
    value::{Row, RowBatch, Value},
};

/// Per column and chunk, only this many unparsable values are logged individually.
pub const LOGGED_WARNINGS_PER_COLUMN: usize = 5;

const NULL_TOKENS: &[&str] = &["null", "undefined", "none"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y年%m月%d日 %H:%M:%S",
    "%Y年%m月%d日 %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y/%m/%d", "%Y-%m-%d", "%Y年%m月%d日"];

/// Largest serial accepted, 9999-12-31 in spreadsheet day counting.
const MAX_SERIAL: f64 = 2_958_466.0;

/// An unparsable cell. The cell itself is loaded as null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionWarning {
    pub raw: String,
    pub target: FieldType,
    pub reason: &'static str,
}

impl fmt::Display for CoercionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot convert '{}' to {}: {}",
            self.raw, self.target, self.reason
        )
    }
}

fn warning(raw: &str, target: FieldType, reason: &'static str) -> CoercionWarning {
    CoercionWarning {
        raw: raw.to_string(),
        target,
        reason,
    }
}

fn is_null_token(value: &str) -> bool {
    value.is_empty() || NULL_TOKENS.iter().any(|t| value.eq_ignore_ascii_case(t))
}

fn number_value_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"number_value\s*:\s*(-?\d+(?:\.\d+)?)").expect("valid number_value pattern")
    })
}

/// Coerces one cell to `target`. `Ok(Value::Null)` covers the null tokens and
/// non-finite numbers; `Err` means the cell was not understood.
pub fn coerce_value(raw: &str, target: FieldType) -> Result<Value, CoercionWarning> {
    match target {
        FieldType::Text => Ok(coerce_text(raw)),
        FieldType::Integer => coerce_integer(raw),
        FieldType::Float => coerce_float(raw),
        FieldType::Date => coerce_datetime(raw, target).map(|dt| match dt {
            Some(dt) => Value::Date(dt.date()),
            None => Value::Null,
        }),
        FieldType::Timestamp => coerce_datetime(raw, target).map(|dt| match dt {
            Some(dt) => Value::Timestamp(dt),
            None => Value::Null,
        }),
        FieldType::Bool => coerce_bool(raw),
    }
}

pub fn coerce_text(raw: &str) -> Value {
    if raw.is_empty() {
        Value::Null
    } else {
        Value::Text(raw.to_string())
    }
}

/// Integer rule: separators, quotes and backslashes are stripped, an embedded
/// `number_value: <num>` is extracted, and fractions truncate toward zero.
pub fn coerce_integer(raw: &str) -> Result<Value, CoercionWarning> {
    let cleaned = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '"' | '\'' | '\\'))
        .collect::<String>();
    let candidate = match number_value_pattern().captures(&cleaned) {
        Some(caps) => caps[1].to_string(),
        None => cleaned.trim().to_string(),
    };
    if is_null_token(&candidate) {
        return Ok(Value::Null);
    }
    if let Ok(parsed) = candidate.parse::<i64>() {
        return Ok(Value::Int64(parsed));
    }
    let parsed = candidate
        .parse::<f64>()
        .map_err(|_| warning(raw, FieldType::Integer, "not a number"))?;
    if !parsed.is_finite() {
        return Ok(Value::Null);
    }
    let truncated = parsed.trunc();
    // i64::MAX is not representable; 2^63 is the first out-of-range float.
    if truncated < i64::MIN as f64 || truncated >= 9_223_372_036_854_775_808.0 {
        return Err(warning(raw, FieldType::Integer, "out of 64-bit range"));
    }
    Ok(Value::Int64(truncated as i64))
}

/// Float rule: `%` and thousands separators are stripped; the percentage is not rescaled.
pub fn coerce_float(raw: &str) -> Result<Value, CoercionWarning> {
    let cleaned = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '%' | ','))
        .collect::<String>();
    let cleaned = cleaned.trim();
    if is_null_token(cleaned) {
        return Ok(Value::Null);
    }
    let parsed = cleaned
        .parse::<f64>()
        .map_err(|_| warning(raw, FieldType::Float, "not a number"))?;
    if parsed.is_finite() {
        Ok(Value::Float64(parsed))
    } else {
        Ok(Value::Null)
    }
}

pub fn coerce_bool(raw: &str) -> Result<Value, CoercionWarning> {
    let trimmed = raw.trim();
    if is_null_token(trimmed) {
        return Ok(Value::Null);
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
        "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
        _ => Err(warning(raw, FieldType::Bool, "not a boolean")),
    }
}

/// Parses a date or timestamp: known patterns first, then spreadsheet serial days.
pub fn coerce_datetime(
    raw: &str,
    target: FieldType,
) -> Result<Option<NaiveDateTime>, CoercionWarning> {
    let trimmed = raw.trim();
    if is_null_token(trimmed) {
        return Ok(None);
    }
    if let Some(parsed) = parse_datetime_patterns(trimmed) {
        return Ok(Some(parsed));
    }
    if is_plain_number(trimmed) {
        let serial = trimmed
            .parse::<f64>()
            .map_err(|_| warning(raw, target, "not a serial date"))?;
        return serial_to_datetime(serial)
            .map(Some)
            .ok_or_else(|| warning(raw, target, "serial date out of range"));
    }
    Err(warning(raw, target, "unrecognised date format"))
}

fn parse_datetime_patterns(value: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
                .map(|date| date.and_time(NaiveTime::MIN))
        })
}

fn is_plain_number(value: &str) -> bool {
    let (int_part, frac_part) = match value.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (value, None),
    };
    !int_part.is_empty()
        && int_part.bytes().all(|b| b.is_ascii_digit())
        && frac_part.is_none_or(|f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
}

/// Converts a spreadsheet serial day count.
///
/// Whole days count from 1900-01-01, minus one below serial 60 and minus two
/// from 60 on, which absorbs the fictitious 1900-02-29 of spreadsheet epochs.
/// The fraction is the time of day, truncated to whole seconds.
pub fn serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 || serial >= MAX_SERIAL {
        return None;
    }
    let days = serial.floor();
    let adjustment = if serial < 60.0 { 1.0 } else { 2.0 };
    let seconds = ((serial - days) * 86_400.0).trunc() as i64;
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)?.and_time(NaiveTime::MIN);
    epoch
        .checked_add_signed(Duration::days((days - adjustment) as i64))?
        .checked_add_signed(Duration::seconds(seconds.min(86_399)))
}

/// One destination column: its name, type and the mapped position feeding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRule {
    pub name: String,
    pub field_type: FieldType,
    /// `None` when the destination field has no source column (null-filled).
    pub source: Option<usize>,
}

/// Per-run transformation from mapped string records to destination rows.
///
/// With a known schema the output follows schema order, schema fields without
/// a source are null-filled and source columns outside the schema are dropped.
/// Without one, every mapped column is kept and typed from the mapping's
/// date and integer column sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionPlan {
    pub columns: Vec<ColumnRule>,
    pub missing: Vec<String>,
    pub dropped: Vec<String>,
}

impl CoercionPlan {
    pub fn build(mapped: &MappedColumns, schema: &ResolvedSchema, mapping: &ColumnMapping) -> Self {
        match schema {
            ResolvedSchema::Known(schema) => {
                let columns = schema
                    .fields
                    .iter()
                    .map(|field| ColumnRule {
                        name: field.name.clone(),
                        field_type: field.field_type,
                        source: mapped.index_of(&field.name),
                    })
                    .collect::<Vec<_>>();
                let missing = columns
                    .iter()
                    .filter(|rule| rule.source.is_none())
                    .map(|rule| rule.name.clone())
                    .collect();
                let dropped = mapped
                    .names
                    .iter()
                    .filter(|name| schema.index_of(name).is_none())
                    .cloned()
                    .collect();
                Self {
                    columns,
                    missing,
                    dropped,
                }
            }
            ResolvedSchema::Unknown => {
                let columns = mapped
                    .names
                    .iter()
                    .enumerate()
                    .map(|(idx, name)| {
                        let field_type = if mapping.date_columns.contains(name) {
                            FieldType::Timestamp
                        } else if mapping.integer_columns.contains(name) {
                            FieldType::Integer
                        } else {
                            FieldType::Text
                        };
                        ColumnRule {
                            name: name.clone(),
                            field_type,
                            source: Some(idx),
                        }
                    })
                    .collect();
                Self {
                    columns,
                    missing: Vec::new(),
                    dropped: Vec::new(),
                }
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|rule| rule.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|rule| rule.name == name)
    }

    /// Logs the schema mismatch, once per batch.
    pub fn log_mismatch(&self) {
        if !self.missing.is_empty() {
            warn!(
                "{} destination field(s) have no source column and will be null: {}",
                self.missing.len(),
                self.missing.iter().join(", ")
            );
        }
        if !self.dropped.is_empty() {
            warn!(
                "{} source column(s) are not in the destination schema and will be dropped: {}",
                self.dropped.len(),
                self.dropped.iter().join(", ")
            );
        }
    }

    /// Coerces mapped records. `first_row` is the data row number of the
    /// first record, used only in log messages.
    pub fn apply(&self, records: &[Vec<String>], first_row: usize) -> (RowBatch, CoercionStats) {
        let mut batch = RowBatch::new(self.names());
        let mut stats = CoercionStats::default();
        batch.rows.reserve(records.len());
        for (offset, record) in records.iter().enumerate() {
            let row: Row = self
                .columns
                .iter()
                .map(|rule| {
                    let Some(raw) = rule.source.and_then(|src| record.get(src)) else {
                        return Value::Null;
                    };
                    match coerce_value(raw, rule.field_type) {
                        Ok(value) => value,
                        Err(issue) => {
                            stats.record(&rule.name, first_row + offset, &issue);
                            Value::Null
                        }
                    }
                })
                .collect();
            batch.rows.push(row);
        }
        stats.log_summary();
        (batch, stats)
    }
}

/// Unparsable value counts per destination column for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoercionStats {
    pub per_column: BTreeMap<String, usize>,
}

impl CoercionStats {
    pub fn total(&self) -> usize {
        self.per_column.values().sum()
    }

    fn record(&mut self, column: &str, row: usize, issue: &CoercionWarning) {
        let count = self.per_column.entry(column.to_string()).or_default();
        *count += 1;
        if *count <= LOGGED_WARNINGS_PER_COLUMN {
            warn!("Row {row}, column '{column}': {issue}; loading null");
        }
    }

    fn log_summary(&self) {
        for (column, count) in &self.per_column {
            if *count > LOGGED_WARNINGS_PER_COLUMN {
                warn!(
                    "Column '{}': {} value(s) could not be converted and were loaded as null ({} not shown)",
                    column,
                    count,
                    count - LOGGED_WARNINGS_PER_COLUMN
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaField, TableSchema};

    fn ts(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hh, mm, ss)
            .unwrap()
    }

    #[test]
    fn integer_strips_separators_and_truncates() {
        assert_eq!(coerce_integer("1,234").unwrap(), Value::Int64(1234));
        assert_eq!(coerce_integer("3.9").unwrap(), Value::Int64(3));
        assert_eq!(coerce_integer("-3.9").unwrap(), Value::Int64(-3));
        assert_eq!(coerce_integer("\"42\"").unwrap(), Value::Int64(42));
        assert_eq!(coerce_integer("\\12\\").unwrap(), Value::Int64(12));
    }

    #[test]
    fn integer_null_tokens_are_null_without_warning() {
        for token in ["", "  ", "null", "NULL", "undefined", "None", "nan", "inf"] {
            assert_eq!(coerce_integer(token).unwrap(), Value::Null, "token {token:?}");
        }
    }

    #[test]
    fn integer_unparsable_value_warns() {
        let issue = coerce_integer("abc").unwrap_err();
        assert_eq!(issue.target, FieldType::Integer);
        assert_eq!(issue.raw, "abc");
        assert!(coerce_integer("1e30").is_err());
    }

    #[test]
    fn integer_extracts_embedded_number_value() {
        assert_eq!(
            coerce_integer(r#"{number_value: "1234"}"#).unwrap(),
            Value::Int64(1234)
        );
        assert_eq!(
            coerce_integer("number_value: -7.5").unwrap(),
            Value::Int64(-7)
        );
    }

    #[test]
    fn float_strips_percent_and_commas() {
        assert_eq!(coerce_float("12.5%").unwrap(), Value::Float64(12.5));
        assert_eq!(coerce_float("1,234.5").unwrap(), Value::Float64(1234.5));
        assert_eq!(coerce_float("undefined").unwrap(), Value::Null);
        assert_eq!(coerce_float("-inf").unwrap(), Value::Null);
        assert!(coerce_float("n/a").is_err());
    }

    #[test]
    fn datetime_patterns_are_tried_in_order() {
        assert_eq!(
            coerce_datetime("2023/4/1 9:05", FieldType::Timestamp).unwrap(),
            Some(ts(2023, 4, 1, 9, 5, 0))
        );
        assert_eq!(
            coerce_datetime("2023/04/01 09:05:30", FieldType::Timestamp).unwrap(),
            Some(ts(2023, 4, 1, 9, 5, 30))
        );
        assert_eq!(
            coerce_datetime("2023-04-01 12:00:00", FieldType::Timestamp).unwrap(),
            Some(ts(2023, 4, 1, 12, 0, 0))
        );
        assert_eq!(
            coerce_datetime("2023-04-01T12:00:00", FieldType::Timestamp).unwrap(),
            Some(ts(2023, 4, 1, 12, 0, 0))
        );
        assert_eq!(
            coerce_datetime("2023-04-01", FieldType::Timestamp).unwrap(),
            Some(ts(2023, 4, 1, 0, 0, 0))
        );
    }

    #[test]
    fn japanese_date_form_is_recognised() {
        assert_eq!(
            coerce_value("2023年4月1日", FieldType::Date).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2023, 4, 1).unwrap())
        );
    }

    #[test]
    fn serial_dates_follow_spreadsheet_epoch() {
        assert_eq!(serial_to_datetime(45737.99779), Some(ts(2025, 3, 21, 23, 56, 49)));
        assert_eq!(serial_to_datetime(45658.0), Some(ts(2025, 1, 1, 0, 0, 0)));
        assert_eq!(serial_to_datetime(61.0), Some(ts(1900, 3, 1, 0, 0, 0)));
        assert_eq!(serial_to_datetime(59.0), Some(ts(1900, 2, 28, 0, 0, 0)));
        assert_eq!(serial_to_datetime(1.5), Some(ts(1900, 1, 1, 12, 0, 0)));
        assert_eq!(serial_to_datetime(-1.0), None);
    }

    #[test]
    fn serial_string_becomes_date_or_timestamp() {
        assert_eq!(
            coerce_value("45737.99779", FieldType::Timestamp).unwrap(),
            Value::Timestamp(ts(2025, 3, 21, 23, 56, 49))
        );
        assert_eq!(
            coerce_value("45737.99779", FieldType::Date).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2025, 3, 21).unwrap())
        );
    }

    #[test]
    fn unparsable_date_warns() {
        assert!(coerce_value("yesterday", FieldType::Date).is_err());
        assert!(coerce_value("12.", FieldType::Date).is_err());
        assert_eq!(coerce_value("none", FieldType::Timestamp).unwrap(), Value::Null);
    }

    #[test]
    fn bool_tokens() {
        assert_eq!(coerce_bool("Yes").unwrap(), Value::Bool(true));
        assert_eq!(coerce_bool("0").unwrap(), Value::Bool(false));
        assert_eq!(coerce_bool("").unwrap(), Value::Null);
        assert!(coerce_bool("maybe").is_err());
    }

    #[test]
    fn text_passes_through_and_empty_is_null() {
        assert_eq!(coerce_text("abc"), Value::Text("abc".into()));
        assert_eq!(coerce_text(""), Value::Null);
        assert_eq!(
            coerce_value("null", FieldType::Text).unwrap(),
            Value::Text("null".into())
        );
    }

    #[test]
    fn plan_for_known_schema_conforms_to_schema_order() {
        let mapped = ColumnMapping::default().map_headers(&[
            "extra".to_string(),
            "count".to_string(),
            "id".to_string(),
        ]);
        let schema = TableSchema::new(vec![
            SchemaField::new("id", FieldType::Integer),
            SchemaField::new("count", FieldType::Integer),
            SchemaField::new("note", FieldType::Text),
        ]);
        let plan = CoercionPlan::build(
            &mapped,
            &ResolvedSchema::Known(schema),
            &ColumnMapping::default(),
        );
        assert_eq!(plan.names(), vec!["id", "count", "note"]);
        assert_eq!(plan.missing, vec!["note"]);
        assert_eq!(plan.dropped, vec!["extra"]);

        let records = vec![mapped.project(&["x".into(), "1,000".into(), "7".into()])];
        let (batch, stats) = plan.apply(&records, 0);
        assert_eq!(
            batch.rows,
            vec![vec![Value::Int64(7), Value::Int64(1000), Value::Null]]
        );
        assert_eq!(stats.total(), 0);
    }

    #[test]
    fn plan_for_unknown_schema_uses_mapping_sets() {
        let mapping = ColumnMapping {
            date_columns: ["CV時間".to_string()].into(),
            integer_columns: ["応募ID".to_string()].into(),
            ..ColumnMapping::default()
        };
        let mapped = mapping.map_headers(&[
            "応募ID".to_string(),
            "CV時間".to_string(),
            "CV名".to_string(),
        ]);
        let plan = CoercionPlan::build(&mapped, &ResolvedSchema::Unknown, &mapping);
        let types = plan.columns.iter().map(|c| c.field_type).collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![FieldType::Integer, FieldType::Timestamp, FieldType::Text]
        );
    }

    #[test]
    fn apply_counts_every_bad_value() {
        let mapped = ColumnMapping::default().map_headers(&["n".to_string()]);
        let schema = TableSchema::new(vec![SchemaField::new("n", FieldType::Integer)]);
        let plan = CoercionPlan::build(
            &mapped,
            &ResolvedSchema::Known(schema),
            &ColumnMapping::default(),
        );
        let records = (0..8).map(|_| vec!["bad".to_string()]).collect::<Vec<_>>();
        let (batch, stats) = plan.apply(&records, 100);
        assert!(batch.rows.iter().all(|row| row[0].is_null()));
        assert_eq!(stats.per_column.get("n"), Some(&8));
    }
}
