//! Configuration constants for the ingester
//!
//! This module centralizes the tunable parameters and defaults used throughout
//! the application.

use std::time::Duration;

// ============================================================================
// Batching
// ============================================================================

/// Rows per batch when the caller does not override it
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

pub const DEFAULT_PICKUP_COLUMN: &str = "tpep_pickup_datetime";

pub const DEFAULT_DROPOFF_COLUMN: &str = "tpep_dropoff_datetime";

// ============================================================================
// Connection Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

/// Timeout for individual statements
///
/// A single INSERT carries up to a few thousand rows, so this is generous.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(180); // 3 minutes

pub const DEFAULT_PG_PORT: u16 = 5432;

/// Postgres rejects statements with more than 65535 bind parameters
pub const PG_MAX_BIND_PARAMS: usize = 65_535;

/// SQLite's default `SQLITE_MAX_VARIABLE_NUMBER`
#[cfg(test)]
pub const SQLITE_MAX_BIND_PARAMS: usize = 32_766;

// ============================================================================
// I/O Configuration
// ============================================================================

/// Buffer size for the decompressed byte stream feeding the CSV parser
///
/// Set to 256KB so the gzip decoder works on large blocks; the CSV reader
/// keeps its own (smaller) buffer on top of this.
pub const READ_BUFFER_SIZE: usize = 256 * 1024; // 256 KB
