//! Load Executor for the direct write dispositions.
//!
//! A transformed chunk is serialized to newline-delimited JSON, which keeps
//! the warehouse from re-inferring column types the way a CSV load would.
//! The payload stays in memory and moves to a temporary file only past the
//! spill threshold. Either way it is owned by [`LoadPayload`] and released
//! when that value drops, on success and on every error path.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
};

use log::{debug, info};
use tempfile::NamedTempFile;

use crate::{
    error::{IngestError, Result},
    schema::TableSchema,
    value::RowBatch,
    warehouse::{JobWait, LoadJobConfig, TableRef, Warehouse, WriteDisposition, wait_for_job},
};

pub const DEFAULT_SPILL_THRESHOLD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadResult {
    pub rows_loaded: usize,
    pub destination_row_count_after: u64,
}

enum PayloadStorage {
    Memory(Vec<u8>),
    Spilled(BufWriter<NamedTempFile>),
}

/// Serialized rows of one chunk.
pub struct LoadPayload {
    rows: usize,
    bytes: usize,
    storage: PayloadStorage,
}

impl LoadPayload {
    pub fn from_batch(batch: &RowBatch, spill_threshold: usize) -> Result<Self> {
        let mut payload = Self {
            rows: 0,
            bytes: 0,
            storage: PayloadStorage::Memory(Vec::new()),
        };
        let mut line = Vec::new();
        for row in &batch.rows {
            line.clear();
            serde_json::to_writer(&mut line, &batch.json_object(row))?;
            line.push(b'\n');
            payload.push_line(&line, spill_threshold)?;
        }
        Ok(payload)
    }

    fn push_line(&mut self, line: &[u8], spill_threshold: usize) -> io::Result<()> {
        if let PayloadStorage::Memory(buffer) = &mut self.storage
            && buffer.len() + line.len() > spill_threshold
        {
            let mut writer = BufWriter::new(NamedTempFile::new()?);
            writer.write_all(buffer)?;
            debug!(
                "Spilling load payload to {:?} after {} byte(s)",
                writer.get_ref().path(),
                buffer.len()
            );
            self.storage = PayloadStorage::Spilled(writer);
        }
        match &mut self.storage {
            PayloadStorage::Memory(buffer) => buffer.extend_from_slice(line),
            PayloadStorage::Spilled(writer) => writer.write_all(line)?,
        }
        self.rows += 1;
        self.bytes += line.len();
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.storage, PayloadStorage::Spilled(_))
    }

    /// Opens the payload for reading from the start.
    pub fn reader(&mut self) -> io::Result<Box<dyn Read + '_>> {
        match &mut self.storage {
            PayloadStorage::Memory(buffer) => Ok(Box::new(buffer.as_slice())),
            PayloadStorage::Spilled(writer) => {
                writer.flush()?;
                let mut file: File = writer.get_ref().reopen()?;
                file.seek(SeekFrom::Start(0))?;
                Ok(Box::new(BufReader::new(file)))
            }
        }
    }
}

/// Options shared by every load of a run.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub wait: JobWait,
    pub spill_threshold: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            wait: JobWait::default(),
            spill_threshold: DEFAULT_SPILL_THRESHOLD_BYTES,
        }
    }
}

/// Loads `batch` into `destination` and blocks until the job finishes.
///
/// `schema` is sent with the job when known; `None` asks for autodetection.
pub fn load_batch(
    warehouse: &mut dyn Warehouse,
    destination: &TableRef,
    batch: &RowBatch,
    disposition: WriteDisposition,
    schema: Option<&TableSchema>,
    options: &LoadOptions,
) -> Result<LoadResult> {
    let mut payload = LoadPayload::from_batch(batch, options.spill_threshold)?;
    debug!(
        "Prepared {} row(s), {} byte(s){} for {}",
        payload.rows(),
        payload.byte_len(),
        if payload.is_spilled() { " on disk" } else { "" },
        destination
    );
    let config = LoadJobConfig {
        destination: destination.clone(),
        disposition,
        schema: schema.cloned(),
    };
    let job = {
        let mut source = payload.reader()?;
        warehouse.submit_load(&config, &mut source)?
    };
    wait_for_job(warehouse, &job, &options.wait)?;

    let destination_row_count_after = warehouse
        .get_table(destination)?
        .map(|info| info.num_rows)
        .ok_or_else(|| {
            IngestError::Warehouse(crate::warehouse::WarehouseError::TableNotFound(
                destination.clone(),
            ))
        })?;
    info!(
        "Loaded {} row(s) into {} with {}; table now holds {} row(s)",
        payload.rows(),
        destination,
        disposition,
        destination_row_count_after
    );
    Ok(LoadResult {
        rows_loaded: payload.rows(),
        destination_row_count_after,
    })
}
