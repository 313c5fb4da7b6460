//! Batch Controller and Failure Tracker.
//!
//! Runs the whole pipeline for one file: encoding detection, header mapping,
//! schema resolution, then the chunk loop. Problems found before the loop are
//! fatal and returned as errors. Inside the loop a chunk that fails is logged,
//! its row range recorded, and the loop moves on to the next chunk.

use std::path::Path;

use anyhow::Context;
use itertools::Itertools;
use log::{error, info, warn};

use crate::{
    coerce::CoercionPlan,
    config::IngestConfig,
    encoding::{EncodingChoice, default_candidates, detect_encoding, fallback_order},
    error::{IngestError, Result},
    load::{LoadOptions, LoadResult, load_batch},
    mapping::MappedColumns,
    reader::ChunkReader,
    schema::{self, ResolvedSchema, TableSchema},
    upsert::upsert_batch,
    warehouse::{CancelToken, TableRef, Warehouse, WriteDisposition},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub index: usize,
    pub start_row: usize,
    pub end_row: usize,
    pub status: ChunkStatus,
    pub rows_loaded: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchReport {
    pub destination: Option<TableRef>,
    pub total_rows: usize,
    pub chunks: Vec<ChunkOutcome>,
    pub destination_row_count: Option<u64>,
}

impl BatchReport {
    pub fn success_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Succeeded)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.chunks.len() - self.success_count()
    }

    /// `[start, end)` data row windows of the failed chunks.
    pub fn failed_ranges(&self) -> Vec<(usize, usize)> {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .map(|c| (c.start_row, c.end_row))
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn rows_loaded(&self) -> usize {
        self.chunks.iter().map(|c| c.rows_loaded).sum()
    }
}

/// Number of chunks for `total_rows` data rows.
pub fn chunk_count(
    total_rows: usize,
    start_row: usize,
    chunk_size: usize,
    max_chunks: Option<usize>,
) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    let count = total_rows.saturating_sub(start_row).div_ceil(chunk_size);
    max_chunks.map_or(count, |max| count.min(max))
}

/// Disposition for the chunk at `index` in direct-load mode.
pub fn disposition_for_chunk(index: usize, requested: WriteDisposition) -> WriteDisposition {
    if index == 0 {
        requested
    } else {
        WriteDisposition::Append
    }
}

/// Share of `total` chunks finished once `completed` are done.
pub fn progress_percent(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    completed.min(total) as f64 / total as f64 * 100.0
}

/// Everything fixed before the first chunk is read.
struct Prepared {
    destination: TableRef,
    reader: ChunkReader,
    mapped: MappedColumns,
    schema: ResolvedSchema,
    plan: CoercionPlan,
    total_rows: usize,
}

pub struct BatchController<'a> {
    config: &'a IngestConfig,
    warehouse: &'a mut dyn Warehouse,
    cancel: CancelToken,
}

impl<'a> BatchController<'a> {
    pub fn new(config: &'a IngestConfig, warehouse: &'a mut dyn Warehouse) -> Self {
        Self {
            config,
            warehouse,
            cancel: CancelToken::new(),
        }
    }

    /// Uses an externally owned token; cancelling it stops the batch between chunks
    /// and interrupts the job wait in progress.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(&mut self, path: &Path, table: &str) -> Result<BatchReport> {
        let prepared = self.prepare(path, table)?;
        let config = self.config;
        let chunks = chunk_count(
            prepared.total_rows,
            config.start_row,
            config.chunk_size,
            config.max_chunks,
        );
        info!(
            "Ingesting {:?} into {}: {} data row(s), {} chunk(s) of {} starting at row {} ({} mode)",
            path,
            prepared.destination,
            prepared.total_rows,
            chunks,
            config.chunk_size,
            config.start_row,
            if config.upsert { "upsert" } else { "direct load" }
        );

        let options = config.load_options(self.cancel.clone());
        let mut report = BatchReport {
            destination: Some(prepared.destination.clone()),
            total_rows: prepared.total_rows,
            ..BatchReport::default()
        };
        for index in 0..chunks {
            let start_row = config.start_row + index * config.chunk_size;
            let end_row = (start_row + config.chunk_size).min(prepared.total_rows);
            if self.cancel.is_cancelled() {
                warn!("Batch cancelled; chunk {index} (rows {start_row}..{end_row}) not processed");
                report.chunks.push(ChunkOutcome {
                    index,
                    start_row,
                    end_row,
                    status: ChunkStatus::Failed,
                    rows_loaded: 0,
                    error: Some("cancelled before start".to_string()),
                });
                continue;
            }
            info!(
                "Processing chunk {}/{} (rows {}..{})",
                index + 1,
                chunks,
                start_row,
                end_row
            );
            let outcome = match self.process_chunk(&prepared, index, start_row, &options) {
                Ok(result) => {
                    info!(
                        "Chunk {}/{} done: {} row(s) loaded, destination holds {}",
                        index + 1,
                        chunks,
                        result.rows_loaded,
                        result.destination_row_count_after
                    );
                    report.destination_row_count = Some(result.destination_row_count_after);
                    ChunkOutcome {
                        index,
                        start_row,
                        end_row,
                        status: ChunkStatus::Succeeded,
                        rows_loaded: result.rows_loaded,
                        error: None,
                    }
                }
                Err(err) => {
                    error!("Chunk {}/{} (rows {}..{}) failed: {:#}", index + 1, chunks, start_row, end_row, err);
                    ChunkOutcome {
                        index,
                        start_row,
                        end_row,
                        status: ChunkStatus::Failed,
                        rows_loaded: 0,
                        error: Some(format!("{err:#}")),
                    }
                }
            };
            report.chunks.push(outcome);
            info!(
                "Chunk {}/{} (rows {}..{}): {:.1}%",
                index + 1,
                chunks,
                start_row,
                end_row,
                progress_percent(index + 1, chunks)
            );
        }
        log_summary(&report);
        Ok(report)
    }

    fn prepare(&mut self, path: &Path, table: &str) -> Result<Prepared> {
        let config = self.config;
        config.validate()?;
        let destination = config.destination(table)?;
        if !path.is_file() {
            return Err(IngestError::Configuration(format!(
                "input file {path:?} does not exist"
            )));
        }

        let candidates = default_candidates();
        let primary = match config.encoding_choice()? {
            EncodingChoice::Auto => detect_encoding(path, &candidates)?,
            EncodingChoice::Fixed(candidate) => {
                info!("Using configured encoding {candidate} for {path:?}");
                candidate
            }
        };
        let reader = ChunkReader::new(path, config.header_row, fallback_order(primary, &candidates));
        let headers = reader.headers()?;
        let total_rows = reader.count_rows()?;

        let mut mapped = config.column_mapping.map_headers(&headers);
        if config.upsert {
            mapped.resolve_key(&config.key_column, config.allow_key_fallback)?;
        }

        let schema = self.resolve_destination(&destination)?;
        if config.upsert {
            match &schema {
                ResolvedSchema::Unknown => {
                    return Err(IngestError::Configuration(format!(
                        "destination {destination} does not exist; upsert mode needs its schema (pass a schema file or use direct-load mode)"
                    )));
                }
                ResolvedSchema::Known(known) if known.index_of(&config.key_column).is_none() => {
                    return Err(IngestError::Configuration(format!(
                        "key column '{}' is not a field of {}",
                        config.key_column, destination
                    )));
                }
                ResolvedSchema::Known(_) => {}
            }
        }

        let plan = CoercionPlan::build(&mapped, &schema, &config.column_mapping);
        plan.log_mismatch();
        Ok(Prepared {
            destination,
            reader,
            mapped,
            schema,
            plan,
            total_rows,
        })
    }

    /// Resolves the destination schema, creating the table from the schema
    /// file when it does not exist yet and a file is configured.
    fn resolve_destination(&mut self, destination: &TableRef) -> Result<ResolvedSchema> {
        let config = self.config;
        let resolved = schema::resolve(&*self.warehouse, destination)?;
        if resolved != ResolvedSchema::Unknown {
            return Ok(resolved);
        }
        let Some(schema_file) = config.schema_file.as_ref() else {
            return Ok(resolved);
        };
        let schema = TableSchema::load(schema_file).map_err(|err| {
            IngestError::Configuration(format!("cannot use schema file {schema_file:?}: {err:#}"))
        })?;
        self.warehouse.create_table(destination, &schema)?;
        info!(
            "Created {} from {:?} with {} field(s)",
            destination,
            schema_file,
            schema.len()
        );
        Ok(ResolvedSchema::Known(schema))
    }

    fn process_chunk(
        &mut self,
        prepared: &Prepared,
        index: usize,
        start_row: usize,
        options: &LoadOptions,
    ) -> anyhow::Result<LoadResult> {
        let config = self.config;
        let raw = prepared
            .reader
            .read_chunk(index, start_row, config.chunk_size)
            .with_context(|| format!("Reading chunk {index}"))?;
        let mapped_records = raw
            .records
            .iter()
            .map(|record| prepared.mapped.project(record))
            .collect::<Vec<_>>();
        let (batch, stats) = prepared.plan.apply(&mapped_records, raw.start_row);
        if stats.total() > 0 {
            warn!(
                "Chunk {index}: {} value(s) loaded as null after failed conversion",
                stats.total()
            );
        }

        if config.upsert {
            let schema = prepared.schema.as_known().ok_or_else(|| {
                anyhow::anyhow!("upsert into {} without a known schema", prepared.destination)
            })?;
            let outcome = upsert_batch(
                &mut *self.warehouse,
                &prepared.destination,
                schema,
                &config.key_column,
                batch,
                options,
            )
            .with_context(|| format!("Upserting chunk {index} into {}", prepared.destination))?;
            Ok(outcome.result)
        } else {
            let disposition = disposition_for_chunk(index, config.write_disposition);
            load_batch(
                &mut *self.warehouse,
                &prepared.destination,
                &batch,
                disposition,
                prepared.schema.as_known(),
                options,
            )
            .with_context(|| {
                format!(
                    "Loading chunk {index} into {} with {disposition}",
                    prepared.destination
                )
            })
        }
    }
}

fn log_summary(report: &BatchReport) {
    let failed = report.failed_ranges();
    if failed.is_empty() {
        info!(
            "Batch complete: {} chunk(s) succeeded, {} row(s) loaded",
            report.success_count(),
            report.rows_loaded()
        );
    } else {
        warn!(
            "Batch finished with failures: {} succeeded, {} failed; failed row ranges: {}",
            report.success_count(),
            report.failed_count(),
            failed
                .iter()
                .map(|(start, end)| format!("[{start}, {end})"))
                .join(", ")
        );
    }
}
