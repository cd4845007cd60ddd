//! Error types for clickhouse-sync.

use thiserror::Error;

/// Errors produced by the sync engine.
///
/// The coordinator treats [`SyncError::SourceTableEmpty`] as a skip rather
/// than a failure, and isolates every other per-table error to that table:
/// sibling tables keep running and the next cycle retries.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A required column is missing from a table's schema. Fatal for the
    /// table; never silently degraded.
    #[error("table {table}: columns not found: {missing:?} (available: {available:?})")]
    SchemaMismatch {
        table: String,
        missing: Vec<String>,
        available: Vec<String>,
    },

    /// The source table holds no (valid) data. The table is skipped this
    /// cycle.
    #[error("source table is empty")]
    SourceTableEmpty,

    /// A query, insert or connection error. Non-fatal for the cycle.
    #[error("database error: {0}")]
    Database(String),

    /// Persisting the checkpoint document failed. Fatal for the table in
    /// the current cycle.
    #[error("checkpoint persistence failed: {0}")]
    Checkpoint(String),

    /// Cooperative shutdown.
    #[error("sync cancelled")]
    Cancelled,

    /// Cycle-level aggregate naming the tables that failed.
    #[error("sync failed for {} table(s): {}", .0.len(), .0.join(", "))]
    Tables(Vec<String>),
}

pub type Result<T> = std::result::Result<T, SyncError>;
