//! Crash-recoverable sync state.
//!
//! The whole run state is one JSON document: which tables are in flight,
//! which day segments completed, and running record counts. Keeping it in
//! a single document (instead of one file per table) makes the state of a
//! run inspectable at a glance and keeps cross-table bookkeeping
//! consistent. Persistence is atomic: write to `<path>.tmp`, then rename
//! over `<path>`.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::segment::TimeSegment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    InProgress,
    Completed,
}

/// Per-table slice of the state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    pub status: TableStatus,
    pub last_synced_time: Option<DateTime<Utc>>,
    pub records_synced: u64,
    pub completed_segments: Vec<TimeSegment>,
}

impl TableState {
    fn new() -> Self {
        Self {
            status: TableStatus::Pending,
            last_synced_time: None,
            records_synced: 0,
            completed_segments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SyncState {
    run_id: String,
    start_time: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    tables: HashMap<String, TableState>,
}

impl SyncState {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            run_id: now.format("sync_%Y%m%d_%H%M%S").to_string(),
            start_time: now,
            last_updated: now,
            tables: HashMap::new(),
        }
    }
}

/// Mutex-guarded checkpoint document shared by all table syncers.
///
/// The lock covers both the in-memory mutation and the persist so
/// concurrent tables cannot interleave a half-updated document onto disk.
/// A failed persist surfaces to the caller and must be treated as fatal
/// for the affected table in the current cycle.
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<SyncState>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(SyncState::fresh()),
        }
    }

    /// Replace the in-memory state with the persisted document. An absent
    /// file is equivalent to an empty state.
    pub async fn load(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match std::fs::read(&self.path) {
            Ok(data) => {
                *state = serde_json::from_slice(&data)
                    .map_err(|e| SyncError::Checkpoint(format!("corrupt state file: {e}")))?;
                tracing::info!(
                    run_id = %state.run_id,
                    tables = state.tables.len(),
                    "loaded checkpoint state from {}",
                    self.path.display()
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Checkpoint(e.to_string())),
        }
    }

    /// Reset to a fresh run identity and persist.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = SyncState::fresh();
        self.persist(&mut state)
    }

    pub async fn is_segment_completed(&self, table: &str, segment: TimeSegment) -> bool {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.completed_segments.contains(&segment))
            .unwrap_or(false)
    }

    /// Record a finished segment together with its insert count, then
    /// persist.
    pub async fn mark_segment_completed(
        &self,
        table: &str,
        segment: TimeSegment,
        records: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .tables
            .entry(table.to_string())
            .or_insert_with(TableState::new);
        entry.status = TableStatus::InProgress;
        entry.completed_segments.push(segment);
        entry.records_synced += records;
        entry.last_synced_time = Some(Utc::now());
        self.persist(&mut state)
    }

    pub async fn mark_table_in_progress(&self, table: &str) -> Result<()> {
        self.set_status(table, TableStatus::InProgress).await
    }

    pub async fn mark_table_completed(&self, table: &str) -> Result<()> {
        self.set_status(table, TableStatus::Completed).await
    }

    async fn set_status(&self, table: &str, status: TableStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .tables
            .entry(table.to_string())
            .or_insert_with(TableState::new)
            .status = status;
        self.persist(&mut state)
    }

    pub async fn table_state(&self, table: &str) -> Option<TableState> {
        self.state.lock().await.tables.get(table).cloned()
    }

    pub async fn total_records_synced(&self) -> u64 {
        self.state
            .lock()
            .await
            .tables
            .values()
            .map(|t| t.records_synced)
            .sum()
    }

    pub async fn run_id(&self) -> String {
        self.state.lock().await.run_id.clone()
    }

    fn persist(&self, state: &mut SyncState) -> Result<()> {
        state.last_updated = Utc::now();
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| SyncError::Checkpoint(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|e| {
            SyncError::Checkpoint(format!("write {} failed: {e}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            SyncError::Checkpoint(format!("rename to {} failed: {e}", self.path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn segment(day: u32) -> TimeSegment {
        TimeSegment {
            start: format!("2024-01-{day:02}T00:00:00Z").parse().unwrap(),
            end: format!("2024-01-{:02}T00:00:00Z", day + 1).parse().unwrap(),
        }
    }

    fn store_in(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path().join("state.json"))
    }

    #[tokio::test]
    async fn absent_file_loads_as_empty_state() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.load().await.unwrap();
        assert!(!store.is_segment_completed("events", segment(1)).await);
        assert_eq!(store.total_records_synced().await, 0);
    }

    #[tokio::test]
    async fn segment_completion_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store
            .mark_segment_completed("events", segment(1), 100)
            .await
            .unwrap();
        store
            .mark_segment_completed("events", segment(2), 50)
            .await
            .unwrap();

        // A second store instance resuming from the same file sees the
        // completed segments.
        let resumed = store_in(&dir);
        resumed.load().await.unwrap();
        assert!(resumed.is_segment_completed("events", segment(1)).await);
        assert!(resumed.is_segment_completed("events", segment(2)).await);
        assert!(!resumed.is_segment_completed("events", segment(3)).await);
        assert_eq!(resumed.total_records_synced().await, 150);
    }

    #[tokio::test]
    async fn segment_match_is_exact_on_both_endpoints() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .mark_segment_completed("events", segment(1), 1)
            .await
            .unwrap();

        let mut shifted = segment(1);
        shifted.end = shifted.end + chrono::Duration::nanoseconds(1);
        assert!(!store.is_segment_completed("events", shifted).await);
    }

    #[tokio::test]
    async fn clear_resets_to_a_fresh_run() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .mark_segment_completed("events", segment(1), 10)
            .await
            .unwrap();
        let old_run = store.run_id().await;
        assert!(old_run.starts_with("sync_"));

        store.clear().await.unwrap();
        assert!(!store.is_segment_completed("events", segment(1)).await);
        assert_eq!(store.total_records_synced().await, 0);

        let resumed = store_in(&dir);
        resumed.load().await.unwrap();
        assert!(!resumed.is_segment_completed("events", segment(1)).await);
    }

    #[tokio::test]
    async fn status_transitions_persist() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.mark_table_in_progress("events").await.unwrap();
        assert_eq!(
            store.table_state("events").await.unwrap().status,
            TableStatus::InProgress
        );

        store.mark_table_completed("events").await.unwrap();
        let resumed = store_in(&dir);
        resumed.load().await.unwrap();
        assert_eq!(
            resumed.table_state("events").await.unwrap().status,
            TableStatus::Completed
        );
    }

    #[tokio::test]
    async fn persist_failure_surfaces() {
        // Point the store at a path whose parent directory does not exist.
        let store = CheckpointStore::new("/nonexistent-dir/state.json");
        let err = store
            .mark_segment_completed("events", segment(1), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Checkpoint(_)));
    }
}
