//! Storage abstraction over the two clusters.
//!
//! The engine talks to the source and the target exclusively through the
//! [`Store`] trait; both sides share one trait because both speak the same
//! dialect. The trait keeps the engine testable against in-memory fakes
//! and keeps every driver concern (wire format, timeouts, error
//! classification) out of the sync logic.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::Result;
use crate::schema::TableSchema;
use crate::types::Row;

/// A streamed sequence of scanned rows.
pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row>> + Send>>;

/// Half-open time-column restriction `column >= start AND column < end`.
#[derive(Debug, Clone)]
pub struct TimeFilter {
    pub column: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Read/write operations the engine needs from a cluster.
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether the table exists on this cluster.
    async fn probe_exists(&self, table: &str) -> Result<bool>;

    /// Maximum of a timestamp column, `None` when the table holds no rows.
    async fn query_max(&self, table: &str, column: &str) -> Result<Option<DateTime<Utc>>>;

    /// Minimum of a timestamp column, `None` when the table holds no rows.
    async fn query_min(&self, table: &str, column: &str) -> Result<Option<DateTime<Utc>>>;

    /// Row count within `[start, end)` of `column`.
    async fn count_range(
        &self,
        table: &str,
        column: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64>;

    /// Stream `columns` of `table`, optionally restricted by `filter`.
    ///
    /// When a filter is given, rows are yielded in ascending order of the
    /// filter column so replays are deterministic under ties. The stream
    /// never materializes the full result set.
    async fn stream_select(
        &self,
        table: &str,
        columns: &[String],
        filter: Option<&TimeFilter>,
    ) -> Result<RowStream>;

    /// Insert `rows` into `table` as one atomic batch.
    ///
    /// Either every row of the batch is committed or none is; a failed
    /// batch leaves previously committed batches untouched.
    async fn bulk_insert(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64>;
}

/// Resolves a table name to its ordered column list with type tags.
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    async fn table_schema(&self, table: &str) -> Result<TableSchema>;
}
