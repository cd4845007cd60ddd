//! Per-table sync engine.
//!
//! One [`TableSyncer`] reconciles one table for one invocation. It probes
//! the newest timestamp on both clusters, decides between a bulk catch-up
//! of the historical range and a tight realtime window, and streams rows
//! from source to target under the dedup filter. Catch-up is checkpointed
//! per day segment; realtime windows deliberately overlap and rely on
//! dedup alone for idempotence.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::coerce::coerce_row;
use crate::config::{Config, SyncMode, TableSpec, TimeRangeConfig};
use crate::dedup::Deduplicator;
use crate::error::{Result, SyncError};
use crate::schema::{ColumnKind, TableSchema};
use crate::segment::{plan_segments, TimeRange, TimeSegment};
use crate::store::{SchemaCatalog, Store, TimeFilter};
use crate::types::Row;

/// How far a realtime window reaches back past the newest known row. Long
/// enough to re-scan everything a failed-over primary may have missed.
fn backward_window() -> Duration {
    Duration::minutes(5)
}

fn min_valid_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("1900-01-01T00:00:00Z")
        .expect("constant timestamp")
        .with_timezone(&Utc)
}

/// Filter a probed timestamp through the validity predicate: anything
/// before 1900 or more than a day in the future is driver or sentinel
/// noise and treated as undefined.
pub(crate) fn valid_probe(
    probed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    probed.filter(|t| *t >= min_valid_time() && *t <= now + Duration::hours(24))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strategy {
    /// Neither side has valid data; the table is skipped this cycle.
    Skip,
    /// The target is missing or lagging beyond the threshold.
    CatchUpThenRealtime,
    RealtimeOnly,
}

pub(crate) fn choose_strategy(
    target_max: Option<DateTime<Utc>>,
    source_max: Option<DateTime<Utc>>,
    threshold: Duration,
) -> Strategy {
    match (target_max, source_max) {
        (None, None) => Strategy::Skip,
        (None, Some(_)) => Strategy::CatchUpThenRealtime,
        (Some(_), None) => Strategy::RealtimeOnly,
        (Some(target), Some(source)) if source - target > threshold => {
            Strategy::CatchUpThenRealtime
        }
        _ => Strategy::RealtimeOnly,
    }
}

pub(crate) struct RealtimeWindow {
    pub range: TimeRange,
    /// Set when the source max regressed below the target max, i.e. the
    /// source identity changed underneath us.
    pub failover: bool,
}

/// Build the realtime window, or `None` when the source has no valid data.
///
/// All bounds are half-open; `source_max + 1s` keeps the newest row inside
/// the window. In the failover case the window reaches the full backward
/// window below `target_max` so rows written to the old primary are picked
/// up once the new primary's clock catches up.
pub(crate) fn realtime_window(
    target_max: Option<DateTime<Utc>>,
    source_max: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<RealtimeWindow> {
    let source_max = source_max?;
    let end = source_max + Duration::seconds(1);

    let window = match target_max {
        None => RealtimeWindow {
            range: TimeRange {
                start: now - backward_window(),
                end,
            },
            failover: false,
        },
        Some(target_max) if source_max < target_max => RealtimeWindow {
            range: TimeRange {
                start: target_max - backward_window(),
                end,
            },
            failover: true,
        },
        Some(target_max) => RealtimeWindow {
            range: TimeRange {
                start: target_max - Duration::seconds(5),
                end,
            },
            failover: false,
        },
    };

    (window.range.start < window.range.end).then_some(window)
}

/// End-to-end reconciliation of one table.
pub struct TableSyncer {
    spec: TableSpec,
    /// All source columns, in schema order; also the insert column order.
    columns: Vec<String>,
    /// Target-side type tags for insert-time coercion, in `columns` order.
    insert_kinds: Vec<(String, ColumnKind)>,
    target_schema: TableSchema,
    source: Arc<dyn Store>,
    target: Arc<dyn Store>,
    checkpoint: Arc<CheckpointStore>,
    dedup: Deduplicator,
    mode: SyncMode,
    batch_size: usize,
    daily_segmentation: bool,
    time_range: TimeRangeConfig,
}

impl std::fmt::Debug for TableSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSyncer")
            .field("spec", &self.spec)
            .field("columns", &self.columns)
            .field("insert_kinds", &self.insert_kinds)
            .field("target_schema", &self.target_schema)
            .field("dedup", &self.dedup)
            .field("mode", &self.mode)
            .field("batch_size", &self.batch_size)
            .field("daily_segmentation", &self.daily_segmentation)
            .field("time_range", &self.time_range)
            .finish()
    }
}

impl TableSyncer {
    /// Resolve schemas and validate the table spec against them.
    ///
    /// The time column and every dedup column must exist on the source;
    /// validation happens here, before any data is touched.
    pub async fn new(
        spec: TableSpec,
        config: &Config,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        source_catalog: &dyn SchemaCatalog,
        target_catalog: &dyn SchemaCatalog,
        checkpoint: Arc<CheckpointStore>,
    ) -> Result<Self> {
        let schema = source_catalog.table_schema(&spec.name).await?;

        if !schema.has_column(&spec.time_field) {
            return Err(SyncError::SchemaMismatch {
                table: spec.name.clone(),
                missing: vec![spec.time_field.clone()],
                available: schema.column_names(),
            });
        }
        let missing: Vec<String> = spec
            .dedupe_keys
            .iter()
            .filter(|key| !schema.has_column(key))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(SyncError::SchemaMismatch {
                table: spec.name.clone(),
                missing,
                available: schema.column_names(),
            });
        }

        let target_schema = target_catalog.table_schema(&spec.name).await?;
        let columns = schema.column_names();
        let insert_kinds = target_schema.kinds_for(&columns);
        let mode = spec.effective_mode(config.sync.mode);
        let batch_size = spec.effective_batch_size(config.sync.batch_size);
        let dedup = Deduplicator::new(&spec);

        Ok(Self {
            spec,
            columns,
            insert_kinds,
            target_schema,
            source,
            target,
            checkpoint,
            dedup,
            mode,
            batch_size,
            daily_segmentation: config.sync.daily_segmentation,
            time_range: config.time_range.clone(),
        })
    }

    /// Run one invocation. Returns the number of rows inserted.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        realtime_threshold: Duration,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        if self.mode == SyncMode::Full {
            return self.full_sync(cancel).await;
        }

        let table = self.spec.name.as_str();
        let now = Utc::now();
        let source_max = valid_probe(
            self.source.query_max(table, &self.spec.time_field).await?,
            now,
        );
        let target_max = valid_probe(
            self.target.query_max(table, &self.spec.time_field).await?,
            now,
        );

        match choose_strategy(target_max, source_max, realtime_threshold) {
            Strategy::Skip => Err(SyncError::SourceTableEmpty),
            Strategy::CatchUpThenRealtime => {
                match (target_max, source_max) {
                    (None, _) => info!(table, "target empty or invalid, starting initial sync"),
                    (Some(t), Some(s)) => info!(
                        table,
                        lag_secs = (s - t).num_seconds(),
                        "lag above realtime threshold, catching up"
                    ),
                    _ => {}
                }
                let caught_up = self.catch_up(cancel, source_max, target_max, now).await?;
                info!(table, "historical data caught up, entering realtime mode");
                let live = self.realtime(cancel).await?;
                Ok(caught_up + live)
            }
            Strategy::RealtimeOnly => self.realtime(cancel).await,
        }
    }

    /// Historical replay over day segments with checkpoint resume.
    async fn catch_up(
        &self,
        cancel: &CancellationToken,
        source_max: Option<DateTime<Utc>>,
        target_max: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let table = self.spec.name.as_str();
        let Some(window) = self.resolve_window(source_max, target_max, now).await? else {
            info!(table, "nothing to catch up, already current");
            return Ok(0);
        };

        info!(
            table,
            start = %window.start.to_rfc3339(),
            end = %window.end.to_rfc3339(),
            "catch-up range resolved"
        );

        let segments = plan_segments(window, self.daily_segmentation);
        debug!(table, segments = segments.len(), "planned day segments");

        let mut total = 0u64;
        for (i, segment) in segments.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if self.checkpoint.is_segment_completed(table, *segment).await {
                debug!(
                    table,
                    segment = i + 1,
                    of = segments.len(),
                    "segment already completed, skipping"
                );
                continue;
            }

            let inserted = self.sync_segment(cancel, *segment).await?;
            self.checkpoint
                .mark_segment_completed(table, *segment, inserted)
                .await?;
            total += inserted;
            info!(
                table,
                segment = i + 1,
                of = segments.len(),
                inserted,
                "segment complete"
            );
        }

        info!(table, total, "catch-up complete");
        Ok(total)
    }

    /// Resolve the full catch-up window `[start, end)`.
    ///
    /// The probed end bound is `source_max + 1s` extended by one
    /// nanosecond: bounds are half-open everywhere, and the extension keeps
    /// the row sitting exactly on the old inclusive maximum covered.
    async fn resolve_window(
        &self,
        source_max: Option<DateTime<Utc>>,
        target_max: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<TimeRange>> {
        let table = self.spec.name.as_str();

        let end = match self.time_range.end {
            Some(end) => end,
            None => match source_max {
                Some(max) => max + Duration::seconds(1) + Duration::nanoseconds(1),
                None => return Err(SyncError::SourceTableEmpty),
            },
        };

        let start = if self.time_range.auto_detect {
            match target_max {
                Some(target_max) => target_max + Duration::milliseconds(1),
                None => {
                    let source_min = valid_probe(
                        self.source.query_min(table, &self.spec.time_field).await?,
                        now,
                    );
                    let Some(source_min) = source_min else {
                        return Err(SyncError::SourceTableEmpty);
                    };
                    let fallback = now - Duration::days(self.time_range.fallback_days);
                    source_min.max(fallback)
                }
            }
        } else if let Some(start) = self.time_range.start {
            start
        } else {
            now - Duration::days(30)
        };

        if start >= end {
            return Ok(None);
        }
        Ok(Some(TimeRange { start, end }))
    }

    /// One pass over the tight window near now. Never checkpointed: the
    /// window intentionally overlaps whatever came before, and the dedup
    /// set alone carries idempotence.
    async fn realtime(&self, cancel: &CancellationToken) -> Result<u64> {
        let table = self.spec.name.as_str();
        let now = Utc::now();
        let source_max = valid_probe(
            self.source.query_max(table, &self.spec.time_field).await?,
            now,
        );
        let target_max = valid_probe(
            self.target.query_max(table, &self.spec.time_field).await?,
            now,
        );

        let Some(window) = realtime_window(target_max, source_max, now) else {
            return Ok(0);
        };
        if window.failover {
            warn!(
                table,
                source_max = %source_max.map(|t| t.to_rfc3339()).unwrap_or_default(),
                target_max = %target_max.map(|t| t.to_rfc3339()).unwrap_or_default(),
                "source max regressed below target max, probable failover; \
                 widening backward window to reconcile the switchover gap"
            );
        }

        let pending = self
            .source
            .count_range(
                table,
                &self.spec.time_field,
                window.range.start,
                window.range.end,
            )
            .await?;
        if pending == 0 {
            return Ok(0);
        }

        debug!(
            table,
            pending,
            start = %window.range.start.to_rfc3339(),
            end = %window.range.end.to_rfc3339(),
            "new rows detected in realtime window"
        );

        let segment = TimeSegment {
            start: window.range.start,
            end: window.range.end,
        };
        let inserted = self.sync_segment(cancel, segment).await?;
        if inserted > 0 {
            info!(table, inserted, "realtime sync complete");
        }
        Ok(inserted)
    }

    /// Stream one window from the source into the target under the dedup
    /// filter. Memory stays bounded by `batch_size` plus the window's
    /// existing-key set.
    async fn sync_segment(
        &self,
        cancel: &CancellationToken,
        segment: TimeSegment,
    ) -> Result<u64> {
        let table = self.spec.name.as_str();

        let existing = self
            .dedup
            .fetch_existing_keys(self.target.as_ref(), table, segment, &self.target_schema)
            .await?;
        debug!(table, existing = existing.len(), "existing keys in window");

        let filter = TimeFilter {
            column: self.spec.time_field.clone(),
            start: segment.start,
            end: segment.end,
        };
        let mut rows = self
            .source
            .stream_select(table, &self.columns, Some(&filter))
            .await?;

        let mut batch: Vec<Row> = Vec::with_capacity(self.batch_size);
        let mut scanned = 0u64;
        let mut inserted = 0u64;
        let mut skipped = 0u64;

        while let Some(row) = rows.next().await {
            let row = row?;
            scanned += 1;

            if existing.contains(&self.dedup.build_key(&row)) {
                skipped += 1;
                continue;
            }
            batch.push(row);

            if batch.len() >= self.batch_size {
                inserted += self.insert_batch(&mut batch).await?;
                debug!(table, scanned, inserted, skipped, "batch flushed");
                // The in-flight batch always lands; shutdown takes effect
                // between batches.
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
            }
        }
        if !batch.is_empty() {
            inserted += self.insert_batch(&mut batch).await?;
        }

        debug!(table, scanned, inserted, skipped, "window scan finished");
        Ok(inserted)
    }

    /// Full-table copy: no time windows, no dedup, no checkpoints.
    async fn full_sync(&self, cancel: &CancellationToken) -> Result<u64> {
        let table = self.spec.name.as_str();
        info!(table, "starting full sync");

        let mut rows = self.source.stream_select(table, &self.columns, None).await?;
        let mut batch: Vec<Row> = Vec::with_capacity(self.batch_size);
        let mut inserted = 0u64;

        while let Some(row) = rows.next().await {
            batch.push(row?);
            if batch.len() >= self.batch_size {
                inserted += self.insert_batch(&mut batch).await?;
                debug!(table, inserted, "batch flushed");
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
            }
        }
        if !batch.is_empty() {
            inserted += self.insert_batch(&mut batch).await?;
        }

        info!(table, inserted, "full sync complete");
        Ok(inserted)
    }

    /// Coerce and submit one batch. The store commits it atomically; the
    /// batch is cleared only after a successful insert.
    async fn insert_batch(&self, batch: &mut Vec<Row>) -> Result<u64> {
        for row in batch.iter_mut() {
            coerce_row(&self.insert_kinds, row);
        }
        let committed = self
            .target
            .bulk_insert(&self.spec.name, &self.columns, batch)
            .await?;
        batch.clear();
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn probe_validity_bounds() {
        let now = ts("2024-06-01T00:00:00Z");
        assert_eq!(valid_probe(None, now), None);
        assert_eq!(valid_probe(Some(ts("1899-12-31T23:59:59Z")), now), None);
        assert_eq!(valid_probe(Some(ts("2024-06-03T00:00:00Z")), now), None);
        assert_eq!(
            valid_probe(Some(ts("2024-06-01T12:00:00Z")), now),
            Some(ts("2024-06-01T12:00:00Z"))
        );
        // The epoch is inside the valid range; emptiness must come from a
        // NULL probe, not from the validity filter.
        assert_eq!(
            valid_probe(Some(ts("1970-01-01T00:00:00Z")), now),
            Some(ts("1970-01-01T00:00:00Z"))
        );
    }

    #[test]
    fn strategy_decision_table() {
        let threshold = Duration::seconds(300);
        let t = ts("2024-06-01T12:00:00Z");

        assert_eq!(choose_strategy(None, None, threshold), Strategy::Skip);
        assert_eq!(
            choose_strategy(None, Some(t), threshold),
            Strategy::CatchUpThenRealtime
        );
        assert_eq!(
            choose_strategy(Some(t), None, threshold),
            Strategy::RealtimeOnly
        );
        // Lag just above the threshold forces a catch-up.
        assert_eq!(
            choose_strategy(Some(t), Some(t + Duration::seconds(301)), threshold),
            Strategy::CatchUpThenRealtime
        );
        // Lag at or below the threshold goes straight to realtime.
        assert_eq!(
            choose_strategy(Some(t), Some(t + Duration::seconds(300)), threshold),
            Strategy::RealtimeOnly
        );
        // A regressed source (failover) is realtime territory.
        assert_eq!(
            choose_strategy(Some(t), Some(t - Duration::seconds(8)), threshold),
            Strategy::RealtimeOnly
        );
    }

    #[test]
    fn realtime_window_steady_state() {
        // target 12:00:00, source 12:00:03 -> [11:59:55, 12:00:04).
        let now = ts("2024-06-01T12:00:05Z");
        let window = realtime_window(
            Some(ts("2024-06-01T12:00:00Z")),
            Some(ts("2024-06-01T12:00:03Z")),
            now,
        )
        .unwrap();
        assert!(!window.failover);
        assert_eq!(window.range.start, ts("2024-06-01T11:59:55Z"));
        assert_eq!(window.range.end, ts("2024-06-01T12:00:04Z"));
    }

    #[test]
    fn realtime_window_failover_reaches_back() {
        // target 12:00:10, regressed source 12:00:02 -> [11:55:10, 12:00:03).
        let now = ts("2024-06-01T12:00:15Z");
        let window = realtime_window(
            Some(ts("2024-06-01T12:00:10Z")),
            Some(ts("2024-06-01T12:00:02Z")),
            now,
        )
        .unwrap();
        assert!(window.failover);
        assert_eq!(window.range.start, ts("2024-06-01T11:55:10Z"));
        assert_eq!(window.range.end, ts("2024-06-01T12:00:03Z"));
    }

    #[test]
    fn realtime_window_empty_target_uses_now() {
        let now = ts("2024-06-01T12:00:00Z");
        let window =
            realtime_window(None, Some(ts("2024-06-01T11:59:00Z")), now).unwrap();
        assert!(!window.failover);
        assert_eq!(window.range.start, ts("2024-06-01T11:55:00Z"));
        assert_eq!(window.range.end, ts("2024-06-01T11:59:01Z"));
    }

    #[test]
    fn realtime_window_requires_source_data() {
        let now = ts("2024-06-01T12:00:00Z");
        assert!(realtime_window(Some(now), None, now).is_none());
        assert!(realtime_window(None, None, now).is_none());
    }
}
