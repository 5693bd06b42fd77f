use async_trait::async_trait;
use std::time::Duration;

use crate::db::{ColumnSchema, Destination, TableRef};
use crate::error::Result;
use crate::formats::RowBatch;

/// Where normalized batches end up
///
/// The driver calls `replace_table` exactly once, before any `append`, and
/// `close` exactly once when the run ends, successfully or not.
#[async_trait]
pub trait BatchSink: Send {
    /// Destructively (re)create `table` with `schema` and no rows
    async fn replace_table(&mut self, table: &TableRef, schema: &ColumnSchema) -> Result<()>;

    /// Append all rows of `batch`, returning the time spent
    async fn append(
        &mut self,
        table: &TableRef,
        schema: &ColumnSchema,
        batch: &RowBatch,
    ) -> Result<Duration>;

    /// Release the underlying connection
    async fn close(self)
    where
        Self: Sized;
}

#[async_trait]
impl BatchSink for Destination {
    async fn replace_table(&mut self, table: &TableRef, schema: &ColumnSchema) -> Result<()> {
        Destination::replace_table(self, table, schema).await
    }

    async fn append(
        &mut self,
        table: &TableRef,
        schema: &ColumnSchema,
        batch: &RowBatch,
    ) -> Result<Duration> {
        Destination::append(self, table, schema, batch).await
    }

    async fn close(self) {
        Destination::close(self).await
    }
}
