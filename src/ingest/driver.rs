use derive_builder::Builder;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sink::BatchSink;
use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_DROPOFF_COLUMN, DEFAULT_PICKUP_COLUMN};
use crate::db::{ColumnSchema, TableRef};
use crate::error::{IngestError, Result};
use crate::formats::{BatchReader, DelimitedConfig, ReaderOptions, RowBatch};
use crate::io::Compression;
use crate::normalize::{EpochUnit, FieldNormalizer};
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Configuration for one ingestion run
#[derive(Debug, Clone, Builder)]
pub struct IngestConfig {
    #[builder(setter(into))]
    pub source_path: PathBuf,
    pub table: TableRef,
    #[builder(default = "DEFAULT_BATCH_SIZE")]
    pub batch_size: usize,
    #[builder(setter(into), default = "DEFAULT_PICKUP_COLUMN.to_string()")]
    pub pickup_column: String,
    #[builder(setter(into), default = "DEFAULT_DROPOFF_COLUMN.to_string()")]
    pub dropoff_column: String,
    #[builder(default)]
    pub delimited: DelimitedConfig,
    #[builder(default)]
    pub compression: Compression,
    #[builder(default)]
    pub epoch_unit: EpochUnit,
}

impl IngestConfig {
    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            batch_size: self.batch_size,
            delimited: self.delimited.clone(),
            compression: self.compression,
        }
    }

    pub fn normalizer(&self) -> FieldNormalizer {
        FieldNormalizer::new(&self.pickup_column, &self.dropoff_column, self.epoch_unit)
    }
}

/// Result of a completed ingestion run
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub table: String,
    pub batches: usize,
    pub rows_loaded: u64,
    pub schema: ColumnSchema,
    pub duration_secs: f64,
    pub p50_batch_ms: Option<u64>,
    pub p90_batch_ms: Option<u64>,
    pub p99_batch_ms: Option<u64>,
}

/// Lifecycle of a run; failure is the `Err` side of each step
enum RunState {
    Start,
    /// Table recreated; the first batch is normalized but not yet written
    Bootstrapped {
        reader: BatchReader,
        schema: ColumnSchema,
        first: RowBatch,
    },
    Loading {
        reader: BatchReader,
        schema: ColumnSchema,
    },
    Done {
        schema: ColumnSchema,
    },
}

impl RunState {
    fn name(&self) -> &'static str {
        match self {
            RunState::Start => "start",
            RunState::Bootstrapped { .. } => "bootstrapped",
            RunState::Loading { .. } => "loading",
            RunState::Done { .. } => "done",
        }
    }
}

/// Runs one ingestion: open → bootstrap from the first batch → append every batch
///
/// The driver owns the reader and the sink for the whole run and releases both
/// whether the run succeeds or fails. Nothing is retried.
pub struct IngestionDriver<S: BatchSink> {
    config: IngestConfig,
    normalizer: FieldNormalizer,
    sink: S,
    telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
    stats: ProgressStats,
}

impl<S: BatchSink> IngestionDriver<S> {
    pub fn new(config: IngestConfig, sink: S) -> Self {
        Self {
            normalizer: config.normalizer(),
            config,
            sink,
            telemetry_tx: None,
            stats: ProgressStats::new(),
        }
    }

    /// Also send every telemetry event to `tx`
    pub fn with_telemetry(mut self, tx: mpsc::UnboundedSender<TelemetryEvent>) -> Self {
        self.telemetry_tx = Some(tx);
        self
    }

    pub async fn run(mut self) -> Result<IngestSummary> {
        let run_id = Uuid::new_v4();
        let start_time = Instant::now();
        info!(
            %run_id,
            source = %self.config.source_path.display(),
            table = %self.config.table,
            batch_size = self.config.batch_size,
            "starting ingestion run"
        );

        let outcome = self.drive().await;

        // The reader was dropped inside `drive`; release the destination too
        let Self {
            config,
            sink,
            stats,
            ..
        } = self;
        sink.close().await;

        let schema = match outcome {
            Ok(schema) => schema,
            Err(e) => {
                warn!(
                    %run_id,
                    batches_loaded = stats.batches_loaded,
                    rows_loaded = stats.rows_loaded,
                    "ingestion run failed: {}",
                    e
                );
                return Err(e);
            }
        };

        let duration = start_time.elapsed();
        info!(
            %run_id,
            batches = stats.batches_loaded,
            rows = stats.rows_loaded,
            "ingestion complete in {:.2}s",
            duration.as_secs_f64()
        );

        let (p50, p90, p99) = stats.get_percentiles();
        Ok(IngestSummary {
            run_id,
            table: config.table.to_string(),
            batches: stats.batches_loaded,
            rows_loaded: stats.rows_loaded,
            schema,
            duration_secs: duration.as_secs_f64(),
            p50_batch_ms: p50,
            p90_batch_ms: p90,
            p99_batch_ms: p99,
        })
    }

    /// Step the state machine until `Done` or the first error
    async fn drive(&mut self) -> Result<ColumnSchema> {
        let mut state = RunState::Start;
        loop {
            debug!(state = state.name(), "run state");
            state = match state {
                RunState::Start => self.bootstrap().await?,
                RunState::Bootstrapped {
                    reader,
                    schema,
                    first,
                } => {
                    self.load(&schema, &first).await?;
                    RunState::Loading { reader, schema }
                }
                // Decoding blocks the runtime thread; only one batch is ever in flight
                RunState::Loading { mut reader, schema } => match reader.next_batch()? {
                    Some(batch) => {
                        // Guards readers that do not share one header across batches
                        schema.check(&batch)?;
                        let batch = self.normalizer.normalize(batch)?;
                        self.load(&schema, &batch).await?;
                        RunState::Loading { reader, schema }
                    }
                    None => RunState::Done { schema },
                },
                RunState::Done { schema } => return Ok(schema),
            };
        }
    }

    /// Open the source, normalize the first batch and recreate the table from it
    async fn bootstrap(&mut self) -> Result<RunState> {
        let mut reader = BatchReader::open(&self.config.source_path, &self.config.reader_options())?;

        let first = reader
            .next_batch()?
            .ok_or_else(|| IngestError::EmptySource {
                path: self.config.source_path.clone(),
            })?;
        let first = self.normalizer.normalize(first)?;

        let schema = ColumnSchema::from_batch(&first);
        self.sink.replace_table(&self.config.table, &schema).await?;
        self.emit(TelemetryEvent::TableBootstrapped {
            table: self.config.table.to_string(),
            columns: schema.len(),
        });

        Ok(RunState::Bootstrapped {
            reader,
            schema,
            first,
        })
    }

    async fn load(&mut self, schema: &ColumnSchema, batch: &RowBatch) -> Result<Duration> {
        let elapsed = self.sink.append(&self.config.table, schema, batch).await?;
        self.emit(TelemetryEvent::BatchLoaded {
            batch_index: batch.index,
            row_count: batch.len(),
            elapsed,
        });
        Ok(elapsed)
    }

    fn emit(&mut self, event: TelemetryEvent) {
        event.log();
        self.stats.update(&event);
        if let Some(tx) = &self.telemetry_tx {
            // A dropped receiver only means nobody is watching
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use async_trait::async_trait;
    use flate2::Compression as Level;
    use flate2::write::GzEncoder;
    use std::fs::File;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// What the recording sink observed, in call order
    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Replace(Vec<String>),
        Append { batch_index: usize, rows: usize },
        Close,
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_append_at: Option<usize>,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn replace_table(&mut self, _table: &TableRef, schema: &ColumnSchema) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Replace(schema.names()));
            Ok(())
        }

        async fn append(
            &mut self,
            _table: &TableRef,
            _schema: &ColumnSchema,
            batch: &RowBatch,
        ) -> Result<Duration> {
            if self.fail_append_at == Some(batch.index) {
                return Err(IngestError::Load {
                    batch_index: batch.index,
                    first_row: batch.first_row,
                    source: crate::error::LoadFailure::Timeout(Duration::from_secs(1)),
                });
            }
            self.calls.lock().unwrap().push(Call::Append {
                batch_index: batch.index,
                rows: batch.len(),
            });
            Ok(Duration::from_millis(1))
        }

        async fn close(self) {
            self.calls.lock().unwrap().push(Call::Close);
        }
    }

    fn write_trips(dir: &TempDir, rows: usize, bad_row: Option<usize>) -> PathBuf {
        let path = dir.path().join("trips.csv.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Level::fast());
        writeln!(
            encoder,
            "VendorID,tpep_pickup_datetime,tpep_dropoff_datetime,fare_amount"
        )
        .unwrap();
        for i in 0..rows {
            let dropoff = if bad_row == Some(i) {
                "not a time".to_string()
            } else {
                format!("2021-01-01 01:{:02}:00", i % 60)
            };
            writeln!(
                encoder,
                "{},2021-01-01 00:{:02}:00,{},{}.5",
                i % 2 + 1,
                i % 60,
                dropoff,
                i
            )
            .unwrap();
        }
        encoder.finish().unwrap();
        path
    }

    fn config(path: PathBuf, batch_size: usize) -> IngestConfig {
        IngestConfigBuilder::default()
            .source_path(path)
            .table(TableRef::new("yellow_taxi_data"))
            .batch_size(batch_size)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_precedes_every_append() {
        let dir = TempDir::new().unwrap();
        let path = write_trips(&dir, 25, None);
        let sink = RecordingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = IngestionDriver::new(config(path, 10), sink.clone())
            .with_telemetry(tx)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.rows_loaded, 25);
        assert_eq!(
            sink.calls(),
            vec![
                Call::Replace(vec![
                    "VendorID".to_string(),
                    "tpep_pickup_datetime".to_string(),
                    "tpep_dropoff_datetime".to_string(),
                    "fare_amount".to_string(),
                ]),
                Call::Append {
                    batch_index: 0,
                    rows: 10
                },
                Call::Append {
                    batch_index: 1,
                    rows: 10
                },
                Call::Append {
                    batch_index: 2,
                    rows: 5
                },
                Call::Close,
            ]
        );

        let mut row_counts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TelemetryEvent::BatchLoaded {
                batch_index,
                row_count,
                ..
            } = event
            {
                assert_eq!(batch_index, row_counts.len());
                row_counts.push(row_count);
            }
        }
        assert_eq!(row_counts, vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_empty_source_never_touches_table() {
        let dir = TempDir::new().unwrap();
        let path = write_trips(&dir, 0, None);
        let sink = RecordingSink::default();

        let err = IngestionDriver::new(config(path, 10), sink.clone())
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EmptySource);
        assert_eq!(sink.calls(), vec![Call::Close]);
    }

    #[tokio::test]
    async fn test_missing_source_is_source_unavailable() {
        let dir = TempDir::new().unwrap();
        let sink = RecordingSink::default();

        let err = IngestionDriver::new(config(dir.path().join("nope.csv.gz"), 10), sink.clone())
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
        assert_eq!(sink.calls(), vec![Call::Close]);
    }

    #[tokio::test]
    async fn test_bad_timestamp_in_first_batch_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let path = write_trips(&dir, 25, Some(3));
        let sink = RecordingSink::default();

        let err = IngestionDriver::new(config(path, 10), sink.clone())
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Normalization);
        assert_eq!(err.batch_index(), Some(0));
        assert_eq!(sink.calls(), vec![Call::Close]);
    }

    #[tokio::test]
    async fn test_bad_timestamp_in_later_batch_keeps_prior_batches() {
        let dir = TempDir::new().unwrap();
        let path = write_trips(&dir, 25, Some(21));
        let sink = RecordingSink::default();

        let err = IngestionDriver::new(config(path, 10), sink.clone())
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Normalization);
        assert_eq!(err.batch_index(), Some(2));

        let appended: Vec<usize> = sink
            .calls()
            .iter()
            .filter_map(|c| match c {
                Call::Append { batch_index, .. } => Some(*batch_index),
                _ => None,
            })
            .collect();
        assert_eq!(appended, vec![0, 1]);
        assert_eq!(sink.calls().last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn test_load_failure_stops_run_without_retry() {
        let dir = TempDir::new().unwrap();
        let path = write_trips(&dir, 25, None);
        let sink = RecordingSink {
            fail_append_at: Some(1),
            ..RecordingSink::default()
        };

        let err = IngestionDriver::new(config(path, 10), sink.clone())
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Load);
        assert_eq!(err.batch_index(), Some(1));
        let calls = sink.calls();
        assert_eq!(calls.len(), 3); // replace, append 0, close
        assert_eq!(calls[2], Call::Close);
    }

    #[tokio::test]
    async fn test_missing_timestamp_column() {
        let dir = TempDir::new().unwrap();
        let path = write_trips(&dir, 5, None);
        let sink = RecordingSink::default();
        let mut cfg = config(path, 10);
        cfg.pickup_column = "lpep_pickup_datetime".to_string();

        let err = IngestionDriver::new(cfg, sink.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::MissingColumn { batch_index: 0, .. }));
    }

    #[test]
    fn test_config_builder_defaults() {
        let cfg = IngestConfigBuilder::default()
            .source_path("trips.csv.gz")
            .table(TableRef::new("t"))
            .build()
            .unwrap();

        assert_eq!(cfg.batch_size, 10_000);
        assert_eq!(cfg.pickup_column, "tpep_pickup_datetime");
        assert_eq!(cfg.dropoff_column, "tpep_dropoff_datetime");
        assert_eq!(cfg.compression, Compression::Auto);
        assert_eq!(cfg.epoch_unit, EpochUnit::Nanoseconds);
    }
}
