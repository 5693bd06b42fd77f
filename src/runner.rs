//! High-level runner API for the ingestion pipeline.
//!
//! Wires a destination connection, the ingestion driver and (optionally) a
//! progress display together. This is the entry point the CLI uses.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::db::{ConnectArgs, Destination};
use crate::formats::DelimitedConfig;
use crate::ingest::{IngestConfig, IngestSummary, IngestionDriver};
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// File format for the source data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Csv,
    Tsv,
}

impl Format {
    /// Parse format from string (case-insensitive)
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(Format::Csv),
            "tsv" => Ok(Format::Tsv),
            _ => Err(anyhow::anyhow!(
                "Unsupported format: {}. Supported formats: csv, tsv",
                s
            )),
        }
    }

    pub fn delimited_config(self) -> DelimitedConfig {
        match self {
            Format::Csv => DelimitedConfig::csv(),
            Format::Tsv => DelimitedConfig::tsv(),
        }
    }
}

/// Arguments for one ingestion run
#[derive(Debug, Clone)]
pub struct IngestArgs {
    pub connect: ConnectArgs,
    pub config: IngestConfig,
    pub quiet: bool,

    // Test-only: write to this SQLite file instead of connecting to Postgres
    #[cfg(test)]
    pub test_sqlite_path: Option<std::path::PathBuf>,
}

/// Run one ingestion with the specified arguments
///
/// Connects to the destination, recreates the target table from the first
/// batch of the source and appends every batch in order.
///
/// # Example
///
/// ```no_run
/// use taxi_ingest::db::{ConnectArgsBuilder, TableRef};
/// use taxi_ingest::ingest::IngestConfigBuilder;
/// use taxi_ingest::runner::{IngestArgs, run_ingest};
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = IngestArgs {
///     connect: ConnectArgsBuilder::default()
///         .host("localhost")
///         .username("root")
///         .password("root")
///         .database("ny_taxi")
///         .build()?,
///     config: IngestConfigBuilder::default()
///         .source_path("yellow_tripdata_2021-01.csv.gz")
///         .table(TableRef::new("yellow_taxi_data"))
///         .build()?,
///     quiet: true,
/// };
///
/// let summary = run_ingest(args).await?;
/// println!("Loaded {} rows in {} batches", summary.rows_loaded, summary.batches);
/// # Ok(())
/// # }
/// ```
pub async fn run_ingest(args: IngestArgs) -> Result<IngestSummary> {
    #[cfg(test)]
    let destination = match &args.test_sqlite_path {
        Some(path) => Destination::sqlite(path).await?,
        None => Destination::connect(&args.connect).await?,
    };

    #[cfg(not(test))]
    let destination = Destination::connect(&args.connect).await?;

    let table = args.config.table.to_string();
    let mut driver = IngestionDriver::new(args.config, destination);

    let progress = if args.quiet {
        None
    } else {
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        driver = driver.with_telemetry(telemetry_tx);
        Some(spawn_progress(telemetry_rx))
    };

    // The driver owns the only sender, so the progress task ends with the run
    let result = driver.run().await;

    if let Some(handle) = progress {
        let _ = handle.await;
    }

    result.with_context(|| format!("ingestion into {} failed", table))
}

/// Render a spinner from telemetry events until the channel closes
fn spawn_progress(
    mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
) -> tokio::task::JoinHandle<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message("reading first batch");

    tokio::spawn(async move {
        let mut stats = ProgressStats::new();

        while let Some(event) = telemetry_rx.recv().await {
            stats.update(&event);
            match &event {
                TelemetryEvent::TableBootstrapped { table, columns } => {
                    spinner.set_message(format!("created {} ({} columns)", table, columns));
                }
                TelemetryEvent::BatchLoaded { .. } => {
                    spinner.set_message(progress_message(&stats));
                }
            }
        }

        spinner.finish_with_message(progress_message(&stats));
    })
}

fn progress_message(stats: &ProgressStats) -> String {
    let mut msg = format!(
        "{} rows in {} batches",
        stats.rows_loaded, stats.batches_loaded
    );
    if let (Some(p50), Some(p90), Some(p99)) = stats.get_percentiles() {
        msg.push_str(&format!(" | p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
    }
    msg
}
