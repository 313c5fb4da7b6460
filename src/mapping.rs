//! Column Mapper: renames source headers to destination field names and
//! resolves the business key column.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Static source → destination mapping plus the fields that need date or
/// integer coercion when the destination schema is not known.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnMapping {
    pub renames: BTreeMap<String, String>,
    pub date_columns: BTreeSet<String>,
    pub integer_columns: BTreeSet<String>,
}

impl ColumnMapping {
    pub fn destination_name<'a>(&'a self, source: &'a str) -> &'a str {
        self.renames.get(source).map(String::as_str).unwrap_or(source)
    }

    /// Maps the header row. Source columns without a configured rename keep
    /// their name; when two columns land on the same destination name the
    /// first one wins.
    pub fn map_headers(&self, headers: &[String]) -> MappedColumns {
        let mut mapped = MappedColumns::default();
        for (idx, header) in headers.iter().enumerate() {
            let destination = self.destination_name(header);
            if destination != header {
                info!("Mapping column '{header}' -> '{destination}'");
            }
            if let Some(existing) = mapped.index_of(destination) {
                warn!(
                    "Column '{}' (position {}) maps to '{}', already taken by source position {}; ignoring it",
                    header,
                    idx + 1,
                    destination,
                    mapped.sources[existing] + 1
                );
                continue;
            }
            mapped.names.push(destination.to_string());
            mapped.sources.push(idx);
        }
        mapped
    }

    /// Maps one record against its header row: `(destination name, cell)` pairs in source order.
    pub fn map_row(&self, headers: &[String], record: &[String]) -> Vec<(String, String)> {
        let mapped = self.map_headers(headers);
        mapped
            .names
            .iter()
            .cloned()
            .zip(mapped.project(record))
            .collect()
    }
}

/// Destination column names and the source record position feeding each.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MappedColumns {
    pub names: Vec<String>,
    pub sources: Vec<usize>,
}

impl MappedColumns {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Reorders a raw record into mapped order; absent cells become empty strings.
    pub fn project(&self, record: &[String]) -> Vec<String> {
        self.sources
            .iter()
            .map(|&src| record.get(src).cloned().unwrap_or_default())
            .collect()
    }

    /// Ensures the key column exists after mapping.
    ///
    /// Without `allow_fallback` a missing key is [`IngestError::KeyColumnMissing`].
    /// With it, the first mapped column is copied into a new column named `key`.
    pub fn resolve_key(&mut self, key: &str, allow_fallback: bool) -> Result<usize, IngestError> {
        if let Some(idx) = self.index_of(key) {
            return Ok(idx);
        }
        let missing = || IngestError::KeyColumnMissing {
            key: key.to_string(),
            available: self.names.clone(),
        };
        if !allow_fallback {
            return Err(missing());
        }
        let (Some(first_name), Some(&first_source)) = (self.names.first(), self.sources.first())
        else {
            return Err(missing());
        };
        warn!(
            "Key column '{}' not found among [{}]; substituting first column '{}' as the key. Merge results depend on that column being unique.",
            key,
            self.names.iter().join(", "),
            first_name
        );
        self.names.push(key.to_string());
        self.sources.push(first_source);
        Ok(self.names.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn cv_mapping() -> ColumnMapping {
        ColumnMapping {
            renames: BTreeMap::from([("売上金額".to_string(), "応募ID".to_string())]),
            ..ColumnMapping::default()
        }
    }

    #[test]
    fn configured_column_is_renamed_and_others_pass_through() {
        let mapped = cv_mapping().map_headers(&headers(&["CV名", "売上金額", "CV時間"]));
        assert_eq!(mapped.names, vec!["CV名", "応募ID", "CV時間"]);
        assert_eq!(mapped.sources, vec![0, 1, 2]);
    }

    #[test]
    fn map_row_pairs_destination_names_with_cells() {
        let row = cv_mapping().map_row(
            &headers(&["売上金額", "memo"]),
            &headers(&["12345", "note"]),
        );
        assert_eq!(
            row,
            vec![
                ("応募ID".to_string(), "12345".to_string()),
                ("memo".to_string(), "note".to_string())
            ]
        );
    }

    #[test]
    fn colliding_destination_keeps_first_column() {
        let mapped = cv_mapping().map_headers(&headers(&["応募ID", "売上金額"]));
        assert_eq!(mapped.names, vec!["応募ID"]);
        assert_eq!(mapped.sources, vec![0]);
    }

    #[test]
    fn project_fills_short_records() {
        let mapped = ColumnMapping::default().map_headers(&headers(&["a", "b", "c"]));
        assert_eq!(mapped.project(&headers(&["1"])), vec!["1", "", ""]);
    }

    #[test]
    fn missing_key_is_an_error_without_fallback() {
        let mut mapped = ColumnMapping::default().map_headers(&headers(&["CV名", "CV時間"]));
        let err = mapped.resolve_key("応募ID", false).unwrap_err();
        assert!(matches!(err, IngestError::KeyColumnMissing { ref key, .. } if key == "応募ID"));
    }

    #[test]
    fn fallback_copies_first_column_into_key() {
        let mut mapped = ColumnMapping::default().map_headers(&headers(&["CV名", "CV時間"]));
        let idx = mapped.resolve_key("応募ID", true).unwrap();
        assert_eq!(idx, 2);
        assert_eq!(mapped.names, vec!["CV名", "CV時間", "応募ID"]);
        assert_eq!(mapped.project(&headers(&["x", "y"])), vec!["x", "y", "x"]);
    }

    #[test]
    fn fallback_with_no_columns_still_fails() {
        let mut mapped = MappedColumns::default();
        assert!(mapped.resolve_key("id", true).is_err());
    }
}
