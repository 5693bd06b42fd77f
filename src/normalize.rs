//! Per-batch timestamp normalization of the pickup/dropoff columns

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::{IngestError, Result};
use crate::formats::{RowBatch, Value};

/// Text layouts accepted for timestamp columns, tried in order
const TIMESTAMP_FORMATS: [&str; 8] = [
    "%Y-%m-%d %H:%M:%S%.f", // 2021-01-01 00:30:10(.123)
    "%Y-%m-%dT%H:%M:%S%.f", // ISO 8601
    "%Y-%m-%d %H:%M",       // Without seconds
    "%Y-%m-%dT%H:%M",       // ISO 8601 without seconds
    "%m/%d/%Y %I:%M:%S %p", // 01/01/2019 12:00:00 AM
    "%m/%d/%Y %H:%M:%S",    // US format with time
    "%m/%d/%Y %H:%M",       // US format without seconds
    "%Y/%m/%d %H:%M:%S",
];

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Unit of numeric epoch values in timestamp columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpochUnit {
    Seconds,
    Milliseconds,
    Microseconds,
    #[default]
    Nanoseconds,
}

impl EpochUnit {
    /// Parse unit from string (case-insensitive)
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "s" | "seconds" => Ok(EpochUnit::Seconds),
            "ms" | "milliseconds" => Ok(EpochUnit::Milliseconds),
            "us" | "microseconds" => Ok(EpochUnit::Microseconds),
            "ns" | "nanoseconds" => Ok(EpochUnit::Nanoseconds),
            _ => Err(anyhow::anyhow!(
                "Unsupported epoch unit: {}. Supported units: s, ms, us, ns",
                s
            )),
        }
    }

    fn nanos(self) -> i128 {
        match self {
            EpochUnit::Seconds => NANOS_PER_SECOND,
            EpochUnit::Milliseconds => 1_000_000,
            EpochUnit::Microseconds => 1_000,
            EpochUnit::Nanoseconds => 1,
        }
    }
}

/// Parses the designated columns of every batch into [`Value::Timestamp`]
///
/// Normalization is batch-local: nothing is carried between batches.
#[derive(Debug, Clone)]
pub struct FieldNormalizer {
    columns: Vec<String>,
    epoch_unit: EpochUnit,
}

impl FieldNormalizer {
    pub fn new(
        pickup_column: impl Into<String>,
        dropoff_column: impl Into<String>,
        epoch_unit: EpochUnit,
    ) -> Self {
        let mut columns = vec![pickup_column.into()];
        let dropoff = dropoff_column.into();
        if !columns.contains(&dropoff) {
            columns.push(dropoff);
        }
        Self {
            columns,
            epoch_unit,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Return `batch` with the designated columns converted to timestamps
    ///
    /// Nulls stay null. Any other value that does not parse fails the whole
    /// batch; no row is skipped.
    pub fn normalize(&self, mut batch: RowBatch) -> Result<RowBatch> {
        let batch_index = batch.index;

        let targets = self
            .columns
            .iter()
            .map(|column| {
                batch
                    .column_index(column)
                    .map(|idx| (idx, column))
                    .ok_or_else(|| IngestError::MissingColumn {
                        batch_index,
                        column: column.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        // Row-major, so the error names the first offending row
        for (row_idx, row) in batch.rows_mut().iter_mut().enumerate() {
            for &(col_idx, column) in &targets {
                let Some(value) = row.get_mut(col_idx) else {
                    continue;
                };
                if let Some(ts) = self.parse_timestamp(value) {
                    *value = Value::Timestamp(ts);
                } else if !value.is_null() {
                    return Err(IngestError::Normalization {
                        batch_index,
                        row: row_idx,
                        column: column.clone(),
                        value: value.to_string(),
                    });
                }
            }
        }

        Ok(batch)
    }

    fn parse_timestamp(&self, value: &Value) -> Option<NaiveDateTime> {
        match value {
            Value::Timestamp(ts) => Some(*ts),
            Value::Text(s) => parse_timestamp_text(s.trim()),
            Value::Integer(v) => from_epoch_nanos(i128::from(*v) * self.epoch_unit.nanos()),
            Value::Float(v) => {
                let nanos = (v * self.epoch_unit.nanos() as f64).round();
                if nanos.is_finite() && nanos.abs() < i128::MAX as f64 {
                    from_epoch_nanos(nanos as i128)
                } else {
                    None
                }
            }
            Value::Null => None,
        }
    }
}

/// Parse a textual timestamp in any accepted layout
pub fn parse_timestamp_text(s: &str) -> Option<NaiveDateTime> {
    for format in &TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ts);
        }
    }

    // Offsets are folded into UTC and then dropped
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.naive_utc());
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn from_epoch_nanos(nanos: i128) -> Option<NaiveDateTime> {
    let secs = i64::try_from(nanos.div_euclid(NANOS_PER_SECOND)).ok()?;
    let sub = nanos.rem_euclid(NANOS_PER_SECOND) as u32;
    DateTime::from_timestamp(secs, sub).map(|dt| dt.naive_utc())
}
