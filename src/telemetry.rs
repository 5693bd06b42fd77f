use std::time::Duration;

/// Telemetry events sent from the driver to observers for progress tracking
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// Destination table was dropped and recreated
    TableBootstrapped { table: String, columns: usize },
    /// Batch of records was successfully appended
    BatchLoaded {
        batch_index: usize,
        row_count: usize,
        elapsed: Duration,
    },
}

impl TelemetryEvent {
    /// Emit the event as a structured log record
    pub fn log(&self) {
        match self {
            TelemetryEvent::TableBootstrapped { table, columns } => {
                tracing::info!(%table, columns, "table bootstrapped");
            }
            TelemetryEvent::BatchLoaded {
                batch_index,
                row_count,
                elapsed,
            } => {
                tracing::info!(
                    batch_index,
                    row_count,
                    elapsed_seconds = elapsed.as_secs_f64(),
                    "inserted batch, took {:.3} seconds",
                    elapsed.as_secs_f64()
                );
            }
        }
    }
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub batches_loaded: usize,
    pub rows_loaded: u64,
    pub batch_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::TableBootstrapped { .. } => {}
            TelemetryEvent::BatchLoaded {
                row_count, elapsed, ..
            } => {
                self.batches_loaded += 1;
                self.rows_loaded += *row_count as u64;
                self.batch_durations_ms.push(elapsed.as_millis() as u64);
            }
        }
    }

    /// Calculate percentile from batch durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.batch_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.batch_durations_ms.clone();
        sorted.sort_unstable();

        let index = (((p / 100.0) * sorted.len() as f64).ceil() as usize).saturating_sub(1);
        let index = index.min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
