//! Upsert Orchestrator: staging table plus MERGE.
//!
//! Each chunk moves through
//! `Transformed → Deduplicated → Staged → Merged → CleanedUp`, or ends in
//! `Failed`. There is no retry inside a chunk. The staging table is dropped
//! whenever it was created, whichever way the chunk ends.

use std::{collections::HashMap, fmt};

use itertools::Itertools;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{IngestError, Result},
    load::{LoadOptions, LoadResult, load_batch},
    schema::TableSchema,
    value::RowBatch,
    warehouse::{MergeStatement, TableRef, Warehouse, WriteDisposition, wait_for_job},
};

/// Duplicate keys logged as samples.
const SAMPLE_KEYS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStage {
    Transformed,
    Deduplicated,
    Staged,
    Merged,
    CleanedUp,
    Failed,
}

impl fmt::Display for UpsertStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpsertStage::Transformed => "transformed",
            UpsertStage::Deduplicated => "deduplicated",
            UpsertStage::Staged => "staged",
            UpsertStage::Merged => "merged",
            UpsertStage::CleanedUp => "cleaned up",
            UpsertStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DedupReport {
    pub removed: usize,
    pub sample_keys: Vec<String>,
    pub null_keys: usize,
}

/// Keeps the last row for every key, preserving the order of the kept rows.
/// Rows with a null key are all kept: they can never match in a MERGE.
pub fn deduplicate(batch: RowBatch, key_index: usize) -> (RowBatch, DedupReport) {
    let mut last_seen: HashMap<String, usize> = HashMap::new();
    let mut occurrences: HashMap<String, usize> = HashMap::new();
    let mut report = DedupReport::default();
    for (idx, row) in batch.rows.iter().enumerate() {
        match row.get(key_index).and_then(|v| v.key_string()) {
            Some(key) => {
                *occurrences.entry(key.clone()).or_default() += 1;
                last_seen.insert(key, idx);
            }
            None => report.null_keys += 1,
        }
    }
    let RowBatch { columns, rows } = batch;
    let total = rows.len();
    let kept = rows
        .into_iter()
        .enumerate()
        .filter(|(idx, row)| match row.get(key_index).and_then(|v| v.key_string()) {
            Some(key) => last_seen.get(&key) == Some(idx),
            None => true,
        })
        .map(|(_, row)| row)
        .collect::<Vec<_>>();
    report.removed = total - kept.len();
    report.sample_keys = occurrences
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(key, _)| key)
        .sorted()
        .take(SAMPLE_KEYS)
        .collect();
    (RowBatch { columns, rows: kept }, report)
}

/// A fresh staging table name next to `destination`.
pub fn staging_table_for(destination: &TableRef) -> TableRef {
    destination.sibling(format!(
        "{}_staging_{}",
        destination.table,
        Uuid::new_v4().simple()
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub result: LoadResult,
    pub dedup: DedupReport,
    pub staging_table: TableRef,
}

/// Upserts `batch` into `destination` keyed on `key`.
///
/// `schema` is the destination schema; `batch` must already be in schema order.
pub fn upsert_batch(
    warehouse: &mut dyn Warehouse,
    destination: &TableRef,
    schema: &TableSchema,
    key: &str,
    batch: RowBatch,
    options: &LoadOptions,
) -> Result<UpsertOutcome> {
    let mut stage = UpsertStage::Transformed;
    let key_index = batch.column_index(key).ok_or_else(|| IngestError::KeyColumnMissing {
        key: key.to_string(),
        available: batch.columns.clone(),
    })?;

    let (batch, dedup) = deduplicate(batch, key_index);
    if dedup.removed > 0 {
        warn!(
            "Removed {} duplicate row(s) on key '{}', keeping the last occurrence (sample keys: {})",
            dedup.removed,
            key,
            dedup.sample_keys.iter().join(", ")
        );
    }
    if dedup.null_keys > 0 {
        warn!(
            "{} row(s) have a null '{}' and will always be inserted as new rows",
            dedup.null_keys, key
        );
    }
    advance(&mut stage, UpsertStage::Deduplicated);

    let staging = staging_table_for(destination);
    warehouse.create_table(&staging, schema)?;
    info!("Created staging table {staging}");

    let target = MergeTarget {
        destination,
        staging: &staging,
        schema,
        key,
        options,
    };
    let merged = target.stage_and_merge(warehouse, &batch, &mut stage);

    match warehouse.delete_table(&staging) {
        Ok(_) => info!("Dropped staging table {staging}"),
        Err(err) => warn!("Failed to drop staging table {staging}: {err}"),
    }

    match merged {
        Ok(destination_row_count_after) => {
            advance(&mut stage, UpsertStage::CleanedUp);
            Ok(UpsertOutcome {
                result: LoadResult {
                    rows_loaded: batch.len(),
                    destination_row_count_after,
                },
                dedup,
                staging_table: staging,
            })
        }
        Err(err) => {
            warn!("Upsert into {destination} failed after stage '{stage}': {err}");
            advance(&mut stage, UpsertStage::Failed);
            Err(err)
        }
    }
}

fn advance(stage: &mut UpsertStage, next: UpsertStage) {
    debug!("Upsert stage {stage} -> {next}");
    *stage = next;
}

/// One chunk's destination, staging table and merge key.
struct MergeTarget<'a> {
    destination: &'a TableRef,
    staging: &'a TableRef,
    schema: &'a TableSchema,
    key: &'a str,
    options: &'a LoadOptions,
}

impl MergeTarget<'_> {
    fn stage_and_merge(
        &self,
        warehouse: &mut dyn Warehouse,
        batch: &RowBatch,
        stage: &mut UpsertStage,
    ) -> Result<u64> {
        load_batch(
            warehouse,
            self.staging,
            batch,
            WriteDisposition::Truncate,
            Some(self.schema),
            self.options,
        )?;
        advance(stage, UpsertStage::Staged);

        let statement = MergeStatement::new(
            self.destination.clone(),
            self.staging.clone(),
            self.key,
            self.schema.names(),
        );
        debug!("MERGE statement:\n{}", statement.to_sql());
        let job = warehouse.submit_merge(&statement)?;
        wait_for_job(warehouse, &job, &self.options.wait)?;
        advance(stage, UpsertStage::Merged);

        let count = warehouse
            .get_table(self.destination)?
            .map(|info| info.num_rows)
            .unwrap_or_default();
        info!(
            "Merged {} row(s) into {} on '{}'; table now holds {} row(s)",
            batch.len(),
            self.destination,
            self.key,
            count
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::{FieldType, SchemaField},
        value::Value,
        warehouse::LocalWarehouse,
    };

    fn seq_schema() -> TableSchema {
        TableSchema::new(vec![
            SchemaField::new("id", FieldType::Integer),
            SchemaField::new("seq", FieldType::Integer),
        ])
    }

    fn rows(keys: &[Option<i64>]) -> RowBatch {
        let mut batch = RowBatch::new(vec!["id".into(), "seq".into()]);
        for (seq, key) in keys.iter().enumerate() {
            let key = key.map(Value::Int64).unwrap_or(Value::Null);
            batch.rows.push(vec![key, Value::Int64(seq as i64)]);
        }
        batch
    }

    #[test]
    fn deduplicate_keeps_last_occurrence() {
        let (batch, report) = deduplicate(rows(&[Some(1), Some(2), Some(1), Some(3), Some(2)]), 0);
        let kept = batch
            .rows
            .iter()
            .map(|r| (r[0].clone(), r[1].clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            kept,
            vec![
                (Value::Int64(1), Value::Int64(2)),
                (Value::Int64(3), Value::Int64(3)),
                (Value::Int64(2), Value::Int64(4)),
            ]
        );
        assert_eq!(report.removed, 2);
        assert_eq!(report.sample_keys, vec!["1", "2"]);
    }

    #[test]
    fn deduplicate_keeps_every_null_key() {
        let (batch, report) = deduplicate(rows(&[None, Some(1), None]), 0);
        assert_eq!(batch.len(), 3);
        assert_eq!(report.null_keys, 2);
        assert_eq!(report.removed, 0);
    }

    #[test]
    fn staging_names_are_unique_siblings() {
        let destination = TableRef::new("p", "d", "cv_report");
        let a = staging_table_for(&destination);
        let b = staging_table_for(&destination);
        assert_ne!(a, b);
        assert_eq!(a.dataset, "d");
        assert!(a.table.starts_with("cv_report_staging_"));
        assert_eq!(a.table.len(), "cv_report_staging_".len() + 32);
    }

    #[test]
    fn upsert_merges_deduplicated_rows_and_drops_staging() {
        let mut wh = LocalWarehouse::in_memory();
        let destination = TableRef::new("p", "d", "cv_report");
        wh.create_table(&destination, &seq_schema()).unwrap();

        let outcome = upsert_batch(
            &mut wh,
            &destination,
            &seq_schema(),
            "id",
            rows(&[Some(1), Some(2), Some(1)]),
            &LoadOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome.result.rows_loaded, 2);
        assert_eq!(outcome.result.destination_row_count_after, 2);
        assert_eq!(outcome.dedup.removed, 1);
        assert_eq!(wh.table_names(), vec![destination.clone()]);
        let stored = wh.table_rows(&destination).unwrap();
        let first = stored
            .iter()
            .find(|row| row["id"] == serde_json::json!(1))
            .unwrap();
        assert_eq!(first["seq"], serde_json::json!(2));
    }

    #[test]
    fn failed_merge_still_drops_staging() {
        let mut wh = LocalWarehouse::in_memory();
        let destination = TableRef::new("p", "d", "missing");

        let err = upsert_batch(
            &mut wh,
            &destination,
            &seq_schema(),
            "id",
            rows(&[Some(1)]),
            &LoadOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, IngestError::JobFailed { .. }));
        assert!(wh.table_names().is_empty());
    }
}
