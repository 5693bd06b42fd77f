pub mod driver;
pub mod sink;

pub use driver::{IngestConfig, IngestConfigBuilder, IngestSummary, IngestionDriver};
pub use sink::BatchSink;
