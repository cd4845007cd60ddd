//! Cross-table orchestration.
//!
//! The coordinator fans the enabled tables out onto tokio tasks under a
//! counting semaphore and aggregates their outcomes. A failing table never
//! cancels its siblings; the cadence loop retries it next cycle.

use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::checkpoint::CheckpointStore;
use crate::config::{Config, TableSpec};
use crate::error::{Result, SyncError};
use crate::store::{SchemaCatalog, Store};
use crate::syncer::TableSyncer;

#[derive(Clone)]
pub struct Coordinator {
    config: Arc<Config>,
    source: Arc<dyn Store>,
    target: Arc<dyn Store>,
    source_catalog: Arc<dyn SchemaCatalog>,
    target_catalog: Arc<dyn SchemaCatalog>,
    checkpoint: Arc<CheckpointStore>,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        source: Arc<dyn Store>,
        target: Arc<dyn Store>,
        source_catalog: Arc<dyn SchemaCatalog>,
        target_catalog: Arc<dyn SchemaCatalog>,
        checkpoint: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            source_catalog,
            target_catalog,
            checkpoint,
        }
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    /// Run every enabled table once, at most `max_concurrency` at a time.
    ///
    /// Empty source tables are skipped silently; any other per-table error
    /// is collected and reported as one composite error naming the failed
    /// tables.
    pub async fn run_all(
        &self,
        cancel: &CancellationToken,
        realtime_threshold: Duration,
    ) -> Result<()> {
        let enabled: Vec<TableSpec> = self.config.enabled_tables().into_iter().cloned().collect();
        if enabled.is_empty() {
            return Err(SyncError::Config("no enabled tables to sync".into()));
        }

        info!(
            tables = enabled.len(),
            max_concurrency = self.config.sync.max_concurrency,
            "starting sync cycle"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.sync.max_concurrency));
        let mut handles = Vec::with_capacity(enabled.len());

        for spec in enabled {
            let coordinator = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let name = spec.name.clone();
                let result = coordinator
                    .sync_table(spec, semaphore, cancel, realtime_threshold)
                    .await;
                (name, result)
            }));
        }

        let mut failed = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((name, Ok(records))) => {
                    info!(table = %name, records, "table sync complete");
                }
                Ok((name, Err(SyncError::SourceTableEmpty))) => {
                    info!(table = %name, "source table empty, skipped");
                }
                Ok((name, Err(SyncError::Cancelled))) => {
                    debug!(table = %name, "table sync cancelled");
                }
                Ok((name, Err(e))) => {
                    error!(table = %name, error = %e, "table sync failed");
                    failed.push(name);
                }
                Err(e) => {
                    error!(error = %e, "table task aborted");
                    failed.push("<aborted task>".to_string());
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !failed.is_empty() {
            return Err(SyncError::Tables(failed));
        }
        Ok(())
    }

    async fn sync_table(
        &self,
        spec: TableSpec,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
        realtime_threshold: Duration,
    ) -> Result<u64> {
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let name = spec.name.clone();
        info!(table = %name, "starting table sync");
        self.checkpoint.mark_table_in_progress(&name).await?;

        let started = Instant::now();
        let syncer = TableSyncer::new(
            spec,
            &self.config,
            self.source.clone(),
            self.target.clone(),
            self.source_catalog.as_ref(),
            self.target_catalog.as_ref(),
            self.checkpoint.clone(),
        )
        .await?;

        let records = syncer.run(&cancel, realtime_threshold).await?;
        self.checkpoint.mark_table_completed(&name).await?;
        debug!(
            table = %name,
            records,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "table sync finished"
        );
        Ok(records)
    }
}
