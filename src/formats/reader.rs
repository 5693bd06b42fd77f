use chrono::NaiveDateTime;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::{IngestError, Result};
use crate::io::{Compression, open_source};

/// A single typed field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Type a raw field the way a dataframe reader would: empty is null,
    /// then integer, then finite float, otherwise text
    pub fn infer(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        if let Ok(v) = trimmed.parse::<i64>() {
            return Value::Integer(v);
        }
        if let Ok(v) = trimmed.parse::<f64>()
            && v.is_finite()
        {
            return Value::Float(v);
        }
        Value::Text(raw.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
            Value::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

/// An ordered group of records sharing one column layout
#[derive(Debug, Clone)]
pub struct RowBatch {
    /// Position of this batch in the stream, starting at 0
    pub index: usize,
    /// Offset of the batch's first record within the whole source
    pub first_row: u64,
    columns: Arc<[String]>,
    rows: Vec<Vec<Value>>,
}

impl RowBatch {
    pub fn new(index: usize, first_row: u64, columns: Arc<[String]>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            index,
            first_row,
            columns,
            rows,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [Vec<Value>] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value at `row` for the named column
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let col = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(col))
    }
}

/// Configuration for delimited file reading (CSV, TSV, etc.)
#[derive(Debug, Clone)]
pub struct DelimitedConfig {
    pub delimiter: u8,
    pub has_header: bool,
    pub quote: u8,
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            quote: b'"',
        }
    }
}

impl DelimitedConfig {
    pub fn csv() -> Self {
        Self::default()
    }

    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            has_header: true,
            quote: b'"',
        }
    }
}

/// Options controlling how a source is opened and split
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub batch_size: usize,
    pub delimited: DelimitedConfig,
    pub compression: Compression,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            delimited: DelimitedConfig::default(),
            compression: Compression::Auto,
        }
    }
}

/// Forward-only reader yielding fixed-size batches from a (compressed) delimited file
///
/// Records are decoded incrementally; at most one batch of parsed rows is held
/// at a time. The reader is not restartable: open a new one to read again.
pub struct BatchReader {
    path: PathBuf,
    csv: csv::Reader<Box<dyn Read + Send>>,
    columns: Arc<[String]>,
    batch_size: usize,
    /// First record of a headerless file, read early to size the columns
    pending: Option<csv::StringRecord>,
    record: csv::StringRecord,
    next_index: usize,
    rows_read: u64,
    exhausted: bool,
}

impl BatchReader {
    pub fn open(path: impl AsRef<Path>, options: &ReaderOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if options.batch_size == 0 {
            return Err(IngestError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }

        let stream = open_source(&path, options.compression)?;
        let mut csv = csv::ReaderBuilder::new()
            .delimiter(options.delimited.delimiter)
            .quote(options.delimited.quote)
            .has_headers(options.delimited.has_header)
            .from_reader(stream);

        let mut pending = None;
        let columns: Vec<String> = if options.delimited.has_header {
            let headers = csv
                .headers()
                .map_err(|e| IngestError::from_csv(e, &csv::Position::new()))?;
            headers.iter().map(|h| h.trim().to_string()).collect()
        } else {
            let mut first = csv::StringRecord::new();
            let found = csv
                .read_record(&mut first)
                .map_err(|e| IngestError::from_csv(e, &csv::Position::new()))?;
            let width = if found { first.len() } else { 0 };
            if found {
                pending = Some(first);
            }
            (1..=width).map(|i| format!("column_{}", i)).collect()
        };

        tracing::debug!(path = %path.display(), columns = columns.len(), "opened source");

        Ok(Self {
            path,
            csv,
            columns: columns.into(),
            batch_size: options.batch_size,
            pending,
            record: csv::StringRecord::new(),
            next_index: 0,
            rows_read: 0,
            exhausted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Records handed out so far
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Read the next batch of up to `batch_size` records
    ///
    /// Returns `Ok(None)` once the stream is exhausted, and on every call after.
    pub fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(self.batch_size.min(DEFAULT_BATCH_SIZE));
        if let Some(first) = self.pending.take() {
            rows.push(first.iter().map(Value::infer).collect());
        }

        while rows.len() < self.batch_size {
            match self.csv.read_record(&mut self.record) {
                Ok(true) => rows.push(self.record.iter().map(Value::infer).collect()),
                Ok(false) => {
                    self.exhausted = true;
                    break;
                }
                Err(e) => {
                    // A malformed record poisons the stream; no partial batch
                    self.exhausted = true;
                    let at = self.csv.position().clone();
                    return Err(IngestError::from_csv(e, &at));
                }
            }
        }

        if rows.is_empty() {
            return Ok(None);
        }

        let batch = RowBatch::new(
            self.next_index,
            self.rows_read,
            Arc::clone(&self.columns),
            rows,
        );
        self.next_index += 1;
        self.rows_read += batch.len() as u64;
        Ok(Some(batch))
    }
}

impl Iterator for BatchReader {
    type Item = Result<RowBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}
