//! A local warehouse engine.
//!
//! Tables live in memory and, when opened on a directory, are persisted as one
//! JSON document per table. Jobs run to completion when they are submitted;
//! their outcome is reported through [`Warehouse::job_state`] like a remote
//! job would be. Load and MERGE semantics mirror the cloud warehouse closely
//! enough for the pipeline's invariants to hold against it:
//!
//! * loads honour the write disposition, reject unknown fields and nulls in
//!   REQUIRED fields, and autodetect a schema for a new table when none is given;
//! * a load or MERGE that fails leaves the table untouched;
//! * MERGE rejects a target row matched by more than one source row, and NULL
//!   keys never match.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use super::{
    JobId, JobState, LoadJobConfig, MergeStatement, TableInfo, TableRef, Warehouse,
    WarehouseError, WriteDisposition,
};
use crate::{
    schema::{FieldType, SchemaField, TableSchema},
    value::{DATE_FORMAT, TIMESTAMP_FORMAT},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredTable {
    table: TableRef,
    schema: TableSchema,
    rows: Vec<Vec<JsonValue>>,
}

#[derive(Debug, Default)]
pub struct LocalWarehouse {
    root: Option<PathBuf>,
    tables: BTreeMap<TableRef, StoredTable>,
    jobs: HashMap<JobId, JobState>,
}

impl LocalWarehouse {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens (creating if needed) a directory-backed warehouse and loads every table in it.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("Creating warehouse directory {root:?}"))?;
        let mut tables = BTreeMap::new();
        for entry in fs::read_dir(root).with_context(|| format!("Listing {root:?}"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = File::open(&path).with_context(|| format!("Opening table file {path:?}"))?;
            let stored: StoredTable = serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("Parsing table file {path:?}"))?;
            tables.insert(stored.table.clone(), stored);
        }
        info!("Opened local warehouse at {:?} with {} table(s)", root, tables.len());
        Ok(Self {
            root: Some(root.to_path_buf()),
            tables,
            jobs: HashMap::new(),
        })
    }

    /// Rows of `table` as JSON objects keyed by column name, in storage order.
    pub fn table_rows(&self, table: &TableRef) -> Option<Vec<Map<String, JsonValue>>> {
        let stored = self.tables.get(table)?;
        Some(
            stored
                .rows
                .iter()
                .map(|row| {
                    stored
                        .schema
                        .fields
                        .iter()
                        .zip(row.iter())
                        .map(|(field, value)| (field.name.clone(), value.clone()))
                        .collect()
                })
                .collect(),
        )
    }

    pub fn table_names(&self) -> Vec<TableRef> {
        self.tables.keys().cloned().collect()
    }

    fn table_path(&self, table: &TableRef) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(format!("{}.json", table.qualified())))
    }

    fn persist(&self, table: &TableRef) -> Result<(), WarehouseError> {
        let (Some(root), Some(path)) = (self.root.as_ref(), self.table_path(table)) else {
            return Ok(());
        };
        match self.tables.get(table) {
            Some(stored) => {
                let mut staged = tempfile::NamedTempFile::new_in(root)?;
                {
                    let mut writer = BufWriter::new(staged.as_file_mut());
                    serde_json::to_writer(&mut writer, stored)?;
                    writer.flush()?;
                }
                staged.persist(&path).map_err(|err| WarehouseError::Io(err.error))?;
            }
            None => {
                if path.exists() {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    fn finish_job(&mut self, kind: &str, outcome: Result<(), WarehouseError>) -> JobId {
        let job = JobId::new(format!("{kind}_{}", Uuid::new_v4().simple()));
        let state = match outcome {
            Ok(()) => JobState::Done,
            Err(err) => {
                debug!("Job {job} failed: {err}");
                JobState::Failed(err.to_string())
            }
        };
        self.jobs.insert(job.clone(), state);
        job
    }

    fn run_load(
        &mut self,
        config: &LoadJobConfig,
        source: &mut dyn Read,
    ) -> Result<(), WarehouseError> {
        let records = read_records(source)?;
        let destination = &config.destination;
        let existing = self.tables.get(destination);

        if config.disposition == WriteDisposition::EmptyOnly
            && existing.is_some_and(|t| !t.rows.is_empty())
        {
            return Err(WarehouseError::NotEmpty(destination.clone()));
        }

        let schema = match (existing, &config.schema) {
            (Some(_), Some(schema)) if config.disposition == WriteDisposition::Truncate => {
                schema.clone()
            }
            (Some(table), _) => table.schema.clone(),
            (None, Some(schema)) => schema.clone(),
            (None, None) => autodetect_schema(&records).ok_or_else(|| WarehouseError::InvalidRow {
                row: 0,
                message: "cannot autodetect a schema from empty input".to_string(),
            })?,
        };

        let converted = records
            .iter()
            .enumerate()
            .map(|(idx, record)| conform_record(destination, &schema, record, idx + 1))
            .collect::<Result<Vec<_>, _>>()?;
        let loaded = converted.len();

        let mut rows = match (existing, config.disposition) {
            (Some(table), WriteDisposition::Append | WriteDisposition::EmptyOnly) => {
                table.rows.clone()
            }
            _ => Vec::new(),
        };
        rows.extend(converted);
        self.tables.insert(
            destination.clone(),
            StoredTable {
                table: destination.clone(),
                schema,
                rows,
            },
        );
        self.persist(destination)?;
        debug!(
            "Loaded {} row(s) into {} ({})",
            loaded, destination, config.disposition
        );
        Ok(())
    }

    fn run_merge(&mut self, statement: &MergeStatement) -> Result<(), WarehouseError> {
        let target = self
            .tables
            .get(&statement.target)
            .ok_or_else(|| WarehouseError::TableNotFound(statement.target.clone()))?;
        let source = self
            .tables
            .get(&statement.source)
            .ok_or_else(|| WarehouseError::TableNotFound(statement.source.clone()))?;

        let position = |table: &StoredTable, column: &str| {
            table
                .schema
                .index_of(column)
                .ok_or_else(|| WarehouseError::UnknownField {
                    table: table.table.clone(),
                    field: column.to_string(),
                })
        };
        let target_key = position(target, &statement.key)?;
        let source_key = position(source, &statement.key)?;
        let mut column_pairs = Vec::with_capacity(statement.columns.len());
        for column in &statement.columns {
            column_pairs.push((column.as_str(), position(target, column)?, position(source, column)?));
        }

        let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, row) in target.rows.iter().enumerate() {
            if let Some(key) = key_token(&row[target_key]) {
                by_key.entry(key).or_default().push(idx);
            }
        }

        let mut rows = target.rows.clone();
        let mut matched_by: HashMap<usize, usize> = HashMap::new();
        let mut updated = 0usize;
        let mut inserted = 0usize;
        for (source_idx, source_row) in source.rows.iter().enumerate() {
            let matches = key_token(&source_row[source_key])
                .and_then(|key| by_key.get(&key))
                .cloned()
                .unwrap_or_default();
            if matches.is_empty() {
                let mut row = vec![JsonValue::Null; target.schema.len()];
                for (_, t_idx, s_idx) in &column_pairs {
                    row[*t_idx] = source_row[*s_idx].clone();
                }
                check_required(&target.schema, &row, rows.len() + 1)?;
                rows.push(row);
                inserted += 1;
                continue;
            }
            for target_idx in matches {
                if matched_by.insert(target_idx, source_idx).is_some() {
                    return Err(WarehouseError::MergeConflict {
                        key: source_row[source_key].to_string(),
                    });
                }
                for (column, t_idx, s_idx) in &column_pairs {
                    if *column != statement.key {
                        rows[target_idx][*t_idx] = source_row[*s_idx].clone();
                    }
                }
                updated += 1;
            }
        }

        let target_ref = statement.target.clone();
        if let Some(stored) = self.tables.get_mut(&target_ref) {
            stored.rows = rows;
        }
        self.persist(&target_ref)?;
        debug!("MERGE into {target_ref}: {updated} updated, {inserted} inserted");
        Ok(())
    }
}

impl Warehouse for LocalWarehouse {
    fn get_table(&self, table: &TableRef) -> Result<Option<TableInfo>, WarehouseError> {
        Ok(self.tables.get(table).map(|stored| TableInfo {
            schema: stored.schema.clone(),
            num_rows: stored.rows.len() as u64,
        }))
    }

    fn create_table(&mut self, table: &TableRef, schema: &TableSchema) -> Result<(), WarehouseError> {
        if self.tables.contains_key(table) {
            return Err(WarehouseError::TableAlreadyExists(table.clone()));
        }
        self.tables.insert(
            table.clone(),
            StoredTable {
                table: table.clone(),
                schema: schema.clone(),
                rows: Vec::new(),
            },
        );
        self.persist(table)
    }

    fn delete_table(&mut self, table: &TableRef) -> Result<bool, WarehouseError> {
        let existed = self.tables.remove(table).is_some();
        self.persist(table)?;
        Ok(existed)
    }

    fn submit_load(
        &mut self,
        config: &LoadJobConfig,
        source: &mut dyn Read,
    ) -> Result<JobId, WarehouseError> {
        let outcome = self.run_load(config, source);
        Ok(self.finish_job("load", outcome))
    }

    fn submit_merge(&mut self, statement: &MergeStatement) -> Result<JobId, WarehouseError> {
        debug!("Executing:\n{}", statement.to_sql());
        let outcome = self.run_merge(statement);
        Ok(self.finish_job("query", outcome))
    }

    /// Local jobs are terminal once submitted, so the state is handed out once
    /// and forgotten.
    fn job_state(&mut self, job: &JobId) -> Result<JobState, WarehouseError> {
        self.jobs
            .remove(job)
            .ok_or_else(|| WarehouseError::UnknownJob(job.clone()))
    }
}

fn read_records(source: &mut dyn Read) -> Result<Vec<Map<String, JsonValue>>, WarehouseError> {
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(source).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str::<Map<String, JsonValue>>(&line).map_err(|err| {
            WarehouseError::InvalidRow {
                row: idx + 1,
                message: format!("malformed JSON: {err}"),
            }
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Null identity for MERGE keys: `None` never matches anything.
fn key_token(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

fn check_required(schema: &TableSchema, row: &[JsonValue], row_number: usize) -> Result<(), WarehouseError> {
    for (field, value) in schema.fields.iter().zip(row) {
        if field.is_required() && value.is_null() {
            return Err(WarehouseError::InvalidRow {
                row: row_number,
                message: format!("REQUIRED field '{}' is null", field.name),
            });
        }
    }
    Ok(())
}

fn conform_record(
    table: &TableRef,
    schema: &TableSchema,
    record: &Map<String, JsonValue>,
    row_number: usize,
) -> Result<Vec<JsonValue>, WarehouseError> {
    if let Some(unknown) = record.keys().find(|k| schema.index_of(k).is_none()) {
        return Err(WarehouseError::UnknownField {
            table: table.clone(),
            field: unknown.clone(),
        });
    }
    let row = schema
        .fields
        .iter()
        .map(|field| {
            let value = record.get(&field.name).unwrap_or(&JsonValue::Null);
            convert_cell(value, field.field_type).map_err(|message| WarehouseError::InvalidRow {
                row: row_number,
                message: format!("field '{}': {message}", field.name),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    check_required(schema, &row, row_number)?;
    Ok(row)
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Converts a JSON cell to the stored representation of `field_type`.
fn convert_cell(value: &JsonValue, field_type: FieldType) -> Result<JsonValue, String> {
    if value.is_null() {
        return Ok(JsonValue::Null);
    }
    let mismatch = || format!("cannot store {value} as {field_type}");
    match (field_type, value) {
        (_, JsonValue::Array(_) | JsonValue::Object(_)) => Err(mismatch()),
        (FieldType::Text, JsonValue::String(_)) => Ok(value.clone()),
        (FieldType::Text, other) => Ok(JsonValue::String(other.to_string())),
        (FieldType::Integer, JsonValue::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(JsonValue::from)
            .ok_or_else(mismatch),
        (FieldType::Integer, JsonValue::String(s)) => {
            s.trim().parse::<i64>().map(JsonValue::from).map_err(|_| mismatch())
        }
        (FieldType::Float, JsonValue::Number(n)) => {
            n.as_f64().map(JsonValue::from).ok_or_else(mismatch)
        }
        (FieldType::Float, JsonValue::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .ok_or_else(mismatch),
        (FieldType::Bool, JsonValue::Bool(_)) => Ok(value.clone()),
        (FieldType::Bool, JsonValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(JsonValue::Bool(true)),
            "false" => Ok(JsonValue::Bool(false)),
            _ => Err(mismatch()),
        },
        (FieldType::Date, JsonValue::String(s)) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
            .map(|d| JsonValue::String(d.format(DATE_FORMAT).to_string()))
            .map_err(|_| mismatch()),
        (FieldType::Timestamp, JsonValue::String(s)) => parse_timestamp(s.trim())
            .map(|ts| JsonValue::String(ts.format(TIMESTAMP_FORMAT).to_string()))
            .ok_or_else(mismatch),
        _ => Err(mismatch()),
    }
}

/// Infers a schema from loaded records: fields in first-seen order, all NULLABLE.
fn autodetect_schema(records: &[Map<String, JsonValue>]) -> Option<TableSchema> {
    let mut names: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }
    if names.is_empty() {
        return None;
    }
    let fields = names
        .into_iter()
        .map(|name| {
            let values = records
                .iter()
                .filter_map(|r| r.get(&name))
                .filter(|v| !v.is_null())
                .collect::<Vec<_>>();
            let field_type = detect_type(&values);
            SchemaField::new(name, field_type)
        })
        .collect();
    Some(TableSchema::new(fields))
}

fn detect_type(values: &[&JsonValue]) -> FieldType {
    if values.is_empty() {
        return FieldType::Text;
    }
    if values.iter().all(|v| v.is_boolean()) {
        return FieldType::Bool;
    }
    if values.iter().all(|v| v.is_i64() || v.is_u64()) {
        return FieldType::Integer;
    }
    if values.iter().all(|v| v.is_number()) {
        return FieldType::Float;
    }
    let strings = values.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>();
    if strings.len() != values.len() {
        return FieldType::Text;
    }
    if strings
        .iter()
        .all(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).is_ok())
    {
        return FieldType::Date;
    }
    if strings
        .iter()
        .all(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).is_ok())
    {
        return FieldType::Timestamp;
    }
    FieldType::Text
}
