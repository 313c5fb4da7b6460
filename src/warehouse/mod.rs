//! The warehouse seam.
//!
//! Everything the pipeline needs from the analytical warehouse goes through
//! the [`Warehouse`] trait: table metadata, table creation and deletion, load
//! jobs and MERGE query jobs. Jobs are submitted and then polled with
//! [`wait_for_job`], which bounds the wait and observes cancellation.

mod job;
pub mod local;
mod merge;

use std::{fmt, io::Read, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::IngestError, schema::TableSchema};

pub use job::{CancelToken, JobId, JobState, JobWait, wait_for_job};
pub use local::LocalWarehouse;
pub use merge::{MergeStatement, quote_identifier};

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("table {0} not found")]
    TableNotFound(TableRef),
    #[error("table {0} already exists")]
    TableAlreadyExists(TableRef),
    #[error("table {0} is not empty")]
    NotEmpty(TableRef),
    #[error("row {row} rejected: {message}")]
    InvalidRow { row: usize, message: String },
    #[error("field '{field}' is not in the schema of {table}")]
    UnknownField { table: TableRef, field: String },
    #[error("MERGE must match at most one source row for each target row (key {key})")]
    MergeConflict { key: String },
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A fully qualified `project.dataset.table` reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Parses `project.dataset.table`, `dataset.table` or `table`, completing
    /// the missing parts from the defaults.
    pub fn parse(
        value: &str,
        default_project: Option<&str>,
        default_dataset: Option<&str>,
    ) -> Result<Self, IngestError> {
        let parts = value.trim().split('.').collect::<Vec<_>>();
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(IngestError::Configuration(format!(
                "invalid table reference '{value}'"
            )));
        }
        let need = |default: Option<&str>, what: &str| {
            default
                .filter(|d| !d.trim().is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    IngestError::Configuration(format!(
                        "table reference '{value}' has no {what} and no default {what} is configured"
                    ))
                })
        };
        match parts.as_slice() {
            [project, dataset, table] => Ok(Self::new(*project, *dataset, *table)),
            [dataset, table] => Ok(Self::new(need(default_project, "project")?, *dataset, *table)),
            [table] => Ok(Self::new(
                need(default_project, "project")?,
                need(default_dataset, "dataset")?,
                *table,
            )),
            _ => Err(IngestError::Configuration(format!(
                "invalid table reference '{value}'"
            ))),
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }

    /// A sibling table in the same dataset.
    pub fn sibling(&self, table: impl Into<String>) -> Self {
        Self::new(self.project.clone(), self.dataset.clone(), table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// How a load interacts with rows already in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    #[default]
    #[serde(alias = "WRITE_TRUNCATE")]
    Truncate,
    #[serde(alias = "WRITE_APPEND")]
    Append,
    #[serde(alias = "WRITE_EMPTY")]
    EmptyOnly,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::Truncate => "TRUNCATE",
            WriteDisposition::Append => "APPEND",
            WriteDisposition::EmptyOnly => "EMPTY_ONLY",
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteDisposition {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TRUNCATE" | "WRITE_TRUNCATE" => Ok(WriteDisposition::Truncate),
            "APPEND" | "WRITE_APPEND" => Ok(WriteDisposition::Append),
            "EMPTY_ONLY" | "EMPTY" | "WRITE_EMPTY" => Ok(WriteDisposition::EmptyOnly),
            other => Err(format!(
                "unknown write disposition '{other}' (expected TRUNCATE, APPEND or EMPTY_ONLY)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub schema: TableSchema,
    pub num_rows: u64,
}

/// Configuration of a newline-delimited JSON load job.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadJobConfig {
    pub destination: TableRef,
    pub disposition: WriteDisposition,
    /// `None` asks the warehouse to autodetect the schema.
    pub schema: Option<TableSchema>,
}

pub trait Warehouse {
    fn get_table(&self, table: &TableRef) -> Result<Option<TableInfo>, WarehouseError>;

    fn create_table(&mut self, table: &TableRef, schema: &TableSchema) -> Result<(), WarehouseError>;

    /// Returns whether the table existed.
    fn delete_table(&mut self, table: &TableRef) -> Result<bool, WarehouseError>;

    /// Submits a load of newline-delimited JSON read from `source`.
    fn submit_load(
        &mut self,
        config: &LoadJobConfig,
        source: &mut dyn Read,
    ) -> Result<JobId, WarehouseError>;

    fn submit_merge(&mut self, statement: &MergeStatement) -> Result<JobId, WarehouseError>;

    fn job_state(&mut self, job: &JobId) -> Result<JobState, WarehouseError>;

    /// Best-effort request to stop a job the caller gave up on.
    fn cancel_job(&mut self, _job: &JobId) -> Result<(), WarehouseError> {
        Ok(())
    }
}
