use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use taxi_ingest::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_DROPOFF_COLUMN, DEFAULT_PG_PORT, DEFAULT_PICKUP_COLUMN,
};
use taxi_ingest::db::{ConnectArgsBuilder, TableRef};
use taxi_ingest::ingest::{IngestConfigBuilder, IngestSummary};
use taxi_ingest::io::Compression;
use taxi_ingest::normalize::EpochUnit;
use taxi_ingest::runner::{Format, IngestArgs, run_ingest};

#[derive(Parser, Clone)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Replace a table with the contents of a (gzip-compressed) CSV file
    Ingest {
        /// Database username
        #[arg(long)]
        user: String,

        /// Database password
        #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Database host
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Database port
        #[arg(long, default_value_t = DEFAULT_PG_PORT)]
        port: u16,

        /// Database name
        #[arg(long)]
        db: String,

        /// Target table name (dropped and recreated)
        #[arg(long)]
        table_name: String,

        /// Schema of the target table (default: connection search path)
        #[arg(long)]
        schema: Option<String>,

        /// Path to the source file (.csv, .csv.gz, .tsv, .tsv.gz)
        #[arg(long)]
        source: PathBuf,

        /// Rows per batch
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Column holding the pickup timestamp
        #[arg(long, default_value = DEFAULT_PICKUP_COLUMN)]
        pickup_column: String,

        /// Column holding the dropoff timestamp
        #[arg(long, default_value = DEFAULT_DROPOFF_COLUMN)]
        dropoff_column: String,

        /// File format (csv, tsv) - auto-detected from extension if not specified
        #[arg(long)]
        format: Option<String>,

        /// Compression (auto, gzip, none)
        #[arg(long, default_value = "auto")]
        compression: String,

        /// Unit of numeric epoch timestamps (s, ms, us, ns)
        #[arg(long, default_value = "ns")]
        epoch_unit: String,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,

        /// Show the plan without touching the database
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Ingest {
            user,
            password,
            host,
            port,
            db,
            table_name,
            schema,
            source,
            batch_size,
            pickup_column,
            dropoff_column,
            format,
            compression,
            epoch_unit,
            json,
            quiet,
            dry_run,
        } => {
            init_tracing(quiet);

            let format = match format {
                Some(f) => Format::parse(&f)?,
                None => cli::detect_format_from_path(&source).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Could not detect format from file '{}'.\n\
                         Supported extensions: .csv, .csv.gz, .tsv, .tsv.gz\n\
                         Please specify --format explicitly.",
                        source.display()
                    )
                })?,
            };
            let compression = Compression::parse(&compression)?;
            let epoch_unit = EpochUnit::parse(&epoch_unit)?;

            let table = match schema {
                Some(schema) => TableRef::in_schema(schema, table_name),
                None => TableRef::new(table_name),
            };

            if !quiet || dry_run {
                println!("Taxi Ingest");
                println!("===========");
                println!("Destination: {}@{}:{}/{}", user, host, port, db);
                println!("Source: {}", source.display());
                println!("Table: {}", table);
                println!();
            }

            if dry_run {
                println!("DRY RUN MODE - No data will be loaded");
                println!();
                println!("Configuration:");
                println!("  Format: {:?}", format);
                println!("  Compression: {:?}", compression.resolve(&source));
                println!("  Batch size: {}", batch_size);
                println!("  Timestamp columns: {}, {}", pickup_column, dropoff_column);
                println!("  Epoch unit: {:?}", epoch_unit);
                println!();
                println!("The table {} will be dropped and recreated.", table);
                println!("To execute, run without --dry-run");
                return Ok(());
            }

            let mut connect = ConnectArgsBuilder::default();
            connect.host(host).port(port).username(user).database(db);
            if let Some(password) = password {
                connect.password(password);
            }

            let config = IngestConfigBuilder::default()
                .source_path(source)
                .table(table)
                .batch_size(batch_size)
                .pickup_column(pickup_column)
                .dropoff_column(dropoff_column)
                .delimited(format.delimited_config())
                .compression(compression)
                .epoch_unit(epoch_unit)
                .build()
                .context("invalid ingestion configuration")?;

            let summary = run_ingest(IngestArgs {
                connect: connect.build().context("invalid connection arguments")?,
                config,
                quiet,
            })
            .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
    }
    Ok(())
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if quiet {
        EnvFilter::new("taxi_ingest=warn,sqlx=off")
    } else {
        EnvFilter::new("taxi_ingest=info,sqlx=off")
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_summary(summary: &IngestSummary) {
    println!();
    println!("Ingest Summary");
    println!("==============");
    println!("Run ID: {}", summary.run_id);
    println!("Table: {} ({} columns)", summary.table, summary.schema.len());
    println!("Batches loaded: {}", summary.batches);
    println!("Rows loaded: {}", summary.rows_loaded);
    println!("Duration: {:.2}s", summary.duration_secs);
    if summary.duration_secs > 0.0 {
        println!(
            "Throughput: {:.2} rows/sec",
            summary.rows_loaded as f64 / summary.duration_secs
        );
    }
    if let (Some(p50), Some(p90), Some(p99)) =
        (summary.p50_batch_ms, summary.p90_batch_ms, summary.p99_batch_ms)
    {
        println!("Batch time: p50 {}ms, p90 {}ms, p99 {}ms", p50, p90, p99);
    }
}

/// CLI utility functions for parsing command-line arguments
mod cli {
    use std::path::Path;
    use taxi_ingest::runner::Format;

    /// Auto-detect file format from path, looking through a `.gz` suffix
    pub fn detect_format_from_path(path: &Path) -> Option<Format> {
        let lower = path.to_string_lossy().to_lowercase();
        let lower = lower.strip_suffix(".gz").unwrap_or(&lower);

        if lower.ends_with(".csv") {
            Some(Format::Csv)
        } else if lower.ends_with(".tsv") {
            Some(Format::Tsv)
        } else {
            None
        }
    }

}
