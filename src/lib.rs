//! clickhouse-sync
//!
//! A continuously-running, table-agnostic replication engine between two
//! ClickHouse clusters.
//!
//! # Features
//!
//! - Smart mode: bulk catch-up of the historical range when the target
//!   lags beyond a threshold, then a tight realtime window near now
//! - Day-aligned segmentation with crash-recoverable checkpoints
//! - Set-based deduplication, so every window can be replayed safely
//! - Failover awareness: a regressed source max widens the realtime
//!   window instead of dropping the switchover gap
//! - Bounded memory: rows stream through fixed-size insert batches
//!
//! # CLI Usage
//!
//! ```bash
//! # Continuous replication driven by config.yaml
//! clickhouse-sync --config config.yaml --yes
//!
//! # Preview the plan without touching data
//! clickhouse-sync --config config.yaml --dry-run
//!
//! # Resume a crashed catch-up from its checkpoints
//! clickhouse-sync --config config.yaml --resume --yes
//!
//! # Restrict to specific tables and tighten the cadence
//! clickhouse-sync --tables events,orders --loop-interval 5s --yes
//! ```

pub mod checkpoint;
pub mod clickhouse;
pub mod coerce;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod report;
pub mod schema;
pub mod segment;
pub mod store;
pub mod supervisor;
pub mod syncer;
pub mod types;
pub mod validate;

pub use checkpoint::{CheckpointStore, TableStatus};
pub use clickhouse::ClickHouseStore;
pub use config::{Config, SyncMode, TableSpec};
pub use coordinator::Coordinator;
pub use error::{Result, SyncError};
pub use schema::{ColumnInfo, ColumnKind, TableSchema};
pub use segment::{plan_segments, TimeRange, TimeSegment};
pub use store::{RowStream, SchemaCatalog, Store, TimeFilter};
pub use supervisor::Supervisor;
pub use syncer::TableSyncer;
pub use types::{Row, Value};
