//! Delimited file decoding into typed row batches

pub mod reader;

pub use reader::{BatchReader, DelimitedConfig, ReaderOptions, RowBatch, Value};
