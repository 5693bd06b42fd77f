//! Error types for the ingestion pipeline
//!
//! Every variant is fatal to a run. Each carries enough context (batch index,
//! row offset, column) to diagnose a failure without inspecting the table.

use std::path::PathBuf;
use thiserror::Error;

use crate::db::schema::SqlType;

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Coarse classification of an [`IngestError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SourceUnavailable,
    Parse,
    EmptySource,
    Normalization,
    Schema,
    Load,
    DestinationUnavailable,
    InvalidConfig,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("cannot open source '{}': {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record {record} (line {line}, byte {byte}): {source}")]
    Parse {
        record: u64,
        line: u64,
        byte: u64,
        #[source]
        source: csv::Error,
    },

    #[error("source '{}' contains no records", path.display())]
    EmptySource { path: PathBuf },

    #[error(
        "batch {batch_index}, row {row}: column '{column}' value '{value}' is not a timestamp"
    )]
    Normalization {
        batch_index: usize,
        row: usize,
        column: String,
        value: String,
    },

    #[error("batch {batch_index}: column '{column}' not present in source")]
    MissingColumn { batch_index: usize, column: String },

    #[error("batch {batch_index}: columns {found:?} do not match table columns {expected:?}")]
    SchemaMismatch {
        batch_index: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("failed to create table {table}: {source}")]
    Schema {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to load batch {batch_index} (rows from {first_row}): {source}")]
    Load {
        batch_index: usize,
        first_row: u64,
        #[source]
        source: LoadFailure,
    },

    #[error("cannot connect to destination: {0}")]
    DestinationUnavailable(#[source] sqlx::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a batch append was rejected
#[derive(Error, Debug)]
pub enum LoadFailure {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("statement timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("row {row}: column '{column}' holds {found}, expected {expected:?}")]
    Coercion {
        row: usize,
        column: String,
        expected: SqlType,
        found: &'static str,
    },
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            IngestError::Parse { .. } => ErrorKind::Parse,
            IngestError::EmptySource { .. } => ErrorKind::EmptySource,
            IngestError::Normalization { .. } | IngestError::MissingColumn { .. } => {
                ErrorKind::Normalization
            }
            IngestError::SchemaMismatch { .. } | IngestError::Schema { .. } => ErrorKind::Schema,
            IngestError::Load { .. } => ErrorKind::Load,
            IngestError::DestinationUnavailable(_) => ErrorKind::DestinationUnavailable,
            IngestError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Batch the failure is attributed to, when there is one
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            IngestError::Normalization { batch_index, .. }
            | IngestError::MissingColumn { batch_index, .. }
            | IngestError::SchemaMismatch { batch_index, .. }
            | IngestError::Load { batch_index, .. } => Some(*batch_index),
            _ => None,
        }
    }

    /// Wrap a CSV error, falling back to the reader position for errors
    /// (I/O, decompression) that carry none of their own
    pub(crate) fn from_csv(source: csv::Error, reader_at: &csv::Position) -> Self {
        let position = source.position().unwrap_or(reader_at);
        IngestError::Parse {
            record: position.record(),
            line: position.line(),
            byte: position.byte(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_groups_related_variants() {
        let missing = IngestError::MissingColumn {
            batch_index: 2,
            column: "tpep_pickup_datetime".to_string(),
        };
        assert_eq!(missing.kind(), ErrorKind::Normalization);
        assert_eq!(missing.batch_index(), Some(2));

        let mismatch = IngestError::SchemaMismatch {
            batch_index: 1,
            expected: vec!["a".to_string()],
            found: vec!["b".to_string()],
        };
        assert_eq!(mismatch.kind(), ErrorKind::Schema);

        let empty = IngestError::EmptySource {
            path: PathBuf::from("trips.csv.gz"),
        };
        assert_eq!(empty.kind(), ErrorKind::EmptySource);
        assert_eq!(empty.batch_index(), None);
    }

    #[test]
    fn test_normalization_message_names_column_and_row() {
        let err = IngestError::Normalization {
            batch_index: 3,
            row: 17,
            column: "tpep_dropoff_datetime".to_string(),
            value: "not-a-date".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch 3"));
        assert!(msg.contains("row 17"));
        assert!(msg.contains("tpep_dropoff_datetime"));
    }
}
