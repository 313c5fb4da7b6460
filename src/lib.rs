pub mod batch;
pub mod cli;
pub mod coerce;
pub mod config;
pub mod encoding;
pub mod error;
pub mod io_utils;
pub mod load;
pub mod mapping;
pub mod reader;
pub mod schema;
pub mod table;
pub mod upsert;
pub mod value;
pub mod warehouse;

use std::{env, sync::OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    batch::{BatchController, BatchReport},
    cli::Cli,
    config::IngestConfig,
    error::IngestError,
    warehouse::LocalWarehouse,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("report_ingest", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

/// Runs the command line. `Ok(true)` when every chunk succeeded.
pub fn run() -> Result<bool> {
    init_logging();
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let report = ingest(&cli, &config)?;
    table::print_report(&report);
    Ok(report.is_success())
}

fn build_config(cli: &Cli) -> Result<IngestConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {path:?}");
            IngestConfig::load(path)?
        }
        None => IngestConfig::default(),
    };
    cli.apply_overrides(&mut config);
    debug!("Effective configuration: {config:?}");
    Ok(config)
}

fn ingest(cli: &Cli, config: &IngestConfig) -> Result<BatchReport> {
    let dir = config.warehouse_dir.as_ref().ok_or_else(|| {
        IngestError::Configuration(
            "no warehouse configured; pass --warehouse-dir or set warehouse_dir in the config file"
                .into(),
        )
    })?;
    let mut warehouse = LocalWarehouse::open(dir)?;
    let report = BatchController::new(config, &mut warehouse)
        .run(&cli.csv_file, &cli.table_name)
        .with_context(|| format!("Ingesting {:?} into {}", cli.csv_file, cli.table_name))?;
    Ok(report)
}
