use std::path::PathBuf;

use clap::Parser;

use crate::{config::IngestConfig, warehouse::WriteDisposition};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Load a report CSV into a warehouse table in chunks, upserting on a business key",
    long_about = None
)]
pub struct Cli {
    /// CSV file to ingest
    pub csv_file: PathBuf,
    /// Destination table as `project.dataset.table`, `dataset.table` or `table`
    pub table_name: String,
    /// Data rows per chunk [default: 1000]
    #[arg(long)]
    pub chunk_size: Option<usize>,
    /// Write disposition of the first chunk in direct-load mode [default: TRUNCATE]
    #[arg(long, value_parser = parse_disposition)]
    pub write_disposition: Option<WriteDisposition>,
    /// Load chunks directly instead of merging them on the key column
    #[arg(long)]
    pub no_upsert: bool,
    /// Business key used by the MERGE [default: 応募ID]
    #[arg(long)]
    pub key_column: Option<String>,
    /// Use the first column as the key when the key column is missing
    #[arg(long)]
    pub allow_key_fallback: bool,
    /// `auto` or an encoding label such as `cp932`, `utf-8`, `euc-jp` [default: auto]
    #[arg(long)]
    pub encoding: Option<String>,
    /// Record index of the header row
    #[arg(long)]
    pub header_row: Option<usize>,
    /// First data row to ingest (0-based, header excluded)
    #[arg(long)]
    pub start_row: Option<usize>,
    /// Stop after this many chunks
    #[arg(long)]
    pub max_chunks: Option<usize>,
    /// YAML configuration file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Destination schema (JSON or YAML list of fields) used when the table does not exist
    #[arg(long)]
    pub schema_file: Option<PathBuf>,
    /// Directory holding the local warehouse tables
    #[arg(long)]
    pub warehouse_dir: Option<PathBuf>,
    /// Project completing partial table references
    #[arg(long)]
    pub project: Option<String>,
    /// Dataset completing bare table names
    #[arg(long)]
    pub dataset: Option<String>,
    /// Seconds to wait for one warehouse job (0 waits indefinitely) [default: 600]
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,
}

impl Cli {
    /// Layers the flags that were given over `config`.
    pub fn apply_overrides(&self, config: &mut IngestConfig) {
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(disposition) = self.write_disposition {
            config.write_disposition = disposition;
        }
        if self.no_upsert {
            config.upsert = false;
        }
        if let Some(key) = &self.key_column {
            config.key_column = key.clone();
        }
        if self.allow_key_fallback {
            config.allow_key_fallback = true;
        }
        if let Some(encoding) = &self.encoding {
            config.encoding = encoding.clone();
        }
        if let Some(row) = self.header_row {
            config.header_row = row;
        }
        if let Some(row) = self.start_row {
            config.start_row = row;
        }
        if let Some(max) = self.max_chunks {
            config.max_chunks = Some(max);
        }
        if let Some(path) = &self.schema_file {
            config.schema_file = Some(path.clone());
        }
        if let Some(dir) = &self.warehouse_dir {
            config.warehouse_dir = Some(dir.clone());
        }
        if let Some(project) = &self.project {
            config.project_id = Some(project.clone());
        }
        if let Some(dataset) = &self.dataset {
            config.default_dataset = Some(dataset.clone());
        }
        if let Some(secs) = self.job_timeout_secs {
            config.job_timeout_secs = secs;
        }
    }
}

pub fn parse_disposition(value: &str) -> Result<WriteDisposition, String> {
    value.parse()
}
