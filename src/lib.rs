// Public API - the runner plus the pipeline stages it wires together
pub mod config;
pub mod db;
pub mod error;
pub mod formats;
pub mod ingest;
pub mod io;
pub mod normalize;
pub mod runner;
pub mod telemetry;
