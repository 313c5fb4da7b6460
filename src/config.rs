//! Per-run configuration.
//!
//! One [`IngestConfig`] value is built at start-up from defaults, an optional
//! YAML file and the command-line flags, then passed by reference to every
//! component.

use std::{fs::File, io::BufReader, path::{Path, PathBuf}, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    encoding::EncodingChoice,
    error::IngestError,
    load::{DEFAULT_SPILL_THRESHOLD_BYTES, LoadOptions},
    mapping::ColumnMapping,
    warehouse::{CancelToken, JobWait, TableRef, WriteDisposition},
};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_KEY_COLUMN: &str = "応募ID";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub project_id: Option<String>,
    pub default_dataset: Option<String>,
    pub warehouse_dir: Option<PathBuf>,
    pub schema_file: Option<PathBuf>,
    pub chunk_size: usize,
    pub write_disposition: WriteDisposition,
    pub upsert: bool,
    pub key_column: String,
    pub allow_key_fallback: bool,
    pub encoding: String,
    pub header_row: usize,
    pub start_row: usize,
    pub max_chunks: Option<usize>,
    pub column_mapping: ColumnMapping,
    /// Zero disables the timeout.
    pub job_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub spill_threshold_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            default_dataset: None,
            warehouse_dir: None,
            schema_file: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_disposition: WriteDisposition::Truncate,
            upsert: true,
            key_column: DEFAULT_KEY_COLUMN.to_string(),
            allow_key_fallback: false,
            encoding: "auto".to_string(),
            header_row: 0,
            start_row: 0,
            max_chunks: None,
            column_mapping: ColumnMapping::default(),
            job_timeout_secs: 600,
            poll_interval_ms: 200,
            spill_threshold_bytes: DEFAULT_SPILL_THRESHOLD_BYTES,
        }
    }
}

impl IngestConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening config file {path:?}"))?;
        serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing config file {path:?}"))
    }

    /// Rejects settings that would fail before the first row anyway.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::Configuration(
                "chunk_size must be greater than zero".into(),
            ));
        }
        if self.upsert && self.key_column.trim().is_empty() {
            return Err(IngestError::Configuration(
                "upsert mode needs a key column".into(),
            ));
        }
        if self.max_chunks == Some(0) {
            return Err(IngestError::Configuration(
                "max_chunks must be greater than zero".into(),
            ));
        }
        self.encoding_choice()?;
        Ok(())
    }

    pub fn encoding_choice(&self) -> Result<EncodingChoice, IngestError> {
        EncodingChoice::parse(&self.encoding)
    }

    pub fn destination(&self, table: &str) -> Result<TableRef, IngestError> {
        TableRef::parse(
            table,
            self.project_id.as_deref(),
            self.default_dataset.as_deref(),
        )
    }

    pub fn job_wait(&self, cancel: CancelToken) -> JobWait {
        JobWait {
            timeout: (self.job_timeout_secs > 0).then(|| Duration::from_secs(self.job_timeout_secs)),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            cancel,
        }
    }

    pub fn load_options(&self, cancel: CancelToken) -> LoadOptions {
        LoadOptions {
            wait: self.job_wait(cancel),
            spill_threshold: self.spill_threshold_bytes,
        }
    }
}
