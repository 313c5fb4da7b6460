//! Error taxonomy for the ingestion pipeline.
//!
//! Fatal conditions that stop a batch before any row is read are
//! [`IngestError::Configuration`], [`IngestError::KeyColumnMissing`] and, when
//! the whole file is unreadable, [`IngestError::EncodingExhausted`]. Everything
//! raised while a single chunk is processed is caught by the batch controller
//! and recorded as a chunk failure instead.

use std::{path::PathBuf, time::Duration};

use crate::warehouse::{JobId, WarehouseError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Missing or invalid run configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every candidate encoding failed for the same read.
    #[error("could not read {path:?} with any candidate encoding ({})", render_attempts(.attempts))]
    EncodingExhausted {
        path: PathBuf,
        attempts: Vec<EncodingAttempt>,
    },

    /// The configured business key is absent after column mapping.
    #[error("key column '{key}' not found after mapping (available: {})", .available.join(", "))]
    KeyColumnMissing { key: String, available: Vec<String> },

    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),

    #[error("job {job} failed: {message}")]
    JobFailed { job: JobId, message: String },

    #[error("job {job} did not finish within {timeout:?}")]
    JobTimedOut { job: JobId, timeout: Duration },

    #[error("job {job} cancelled")]
    Cancelled { job: JobId },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One failed decode attempt, kept for the exhaustion report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingAttempt {
    pub encoding: String,
    pub message: String,
}

fn render_attempts(attempts: &[EncodingAttempt]) -> String {
    attempts
        .iter()
        .map(|attempt| format!("{}: {}", attempt.encoding, attempt.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, IngestError>;
