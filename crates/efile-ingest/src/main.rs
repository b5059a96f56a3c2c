//! EFile Ingest - parse pending filings for a submission year

use anyhow::{Context, Result};
use clap::Parser;
use efile_common::logging::{init_logging, LogConfig, LogLevel};
use efile_ingest::config::validate_submission_year;
use efile_ingest::filter::load_ein_filter;
use efile_ingest::parser::XmlFilingParser;
use efile_ingest::storage::{FilingScope, PgBulkWriter, PgFilingStore};
use efile_ingest::{IngestConfig, IngestionPipeline};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "efile-ingest")]
#[command(author, version, about = "Ingest e-filed returns for one submission year")]
struct Cli {
    /// Submission year to process
    #[arg(short, long)]
    year: i32,

    /// CSV file whose `ein` column limits the run to those filers
    #[arg(short, long)]
    ein_file: Option<PathBuf>,

    /// Filings claimed per batch (overrides EFILE_BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Buffered records per type before a bulk write (overrides EFILE_FLUSH_THRESHOLD)
    #[arg(long)]
    flush_threshold: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("efile-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let year = validate_submission_year(cli.year)?;

    let scope = match &cli.ein_file {
        Some(path) => FilingScope::year(year).with_eins(load_ein_filter(path)?),
        None => FilingScope::year(year),
    };

    let mut config = IngestConfig::load()?;
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(threshold) = cli.flush_threshold {
        config.flush_threshold = threshold;
    }
    config.validate()?;

    info!(
        year,
        eins = scope.eins.len(),
        batch_size = config.batch_size,
        flush_threshold = config.flush_threshold,
        filing_dir = %config.filing_dir.display(),
        "Starting ingestion"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    let store = PgFilingStore::new(pool.clone(), &config.filings_table)?;
    let writer = PgBulkWriter::new(pool.clone(), &config.record_table_prefix);
    let parser = XmlFilingParser::new(&config.filing_dir);

    let cancel = CancellationToken::new();
    let mut pipeline = IngestionPipeline::from_config(store, parser, writer, &config)
        .with_cancellation(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            cancel.cancel();
        }
    });

    let summary = pipeline.run(&scope).await?;

    pool.close().await;

    println!("Processed {} filings", summary.processed);
    println!("Missing files: {}", summary.missing);
    for object_id in &summary.missing_ids {
        println!("  {}", object_id);
    }
    if summary.invalid > 0 {
        println!("Invalid filings: {}", summary.invalid);
    }
    if summary.stopped_early {
        println!("Stopped early; rerun to continue");
    }

    Ok(())
}
