//! The cadence loop.
//!
//! Drives the coordinator at a fixed interval until cancelled. Table
//! errors never stop the loop; only cancellation (or a startup
//! configuration failure, handled before the supervisor exists) ends it.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::coordinator::Coordinator;
use crate::error::SyncError;

pub struct Supervisor {
    coordinator: Coordinator,
    loop_interval: Duration,
    realtime_threshold: chrono::Duration,
}

impl Supervisor {
    pub fn new(
        coordinator: Coordinator,
        loop_interval: Duration,
        realtime_threshold: chrono::Duration,
    ) -> Self {
        Self {
            coordinator,
            loop_interval,
            realtime_threshold,
        }
    }

    /// Run sync cycles until the token is cancelled. Returns the number of
    /// completed cycles.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        let mut cycles = 0u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            cycles += 1;
            info!(cycle = cycles, "---- sync cycle starting ----");

            let started = Instant::now();
            match self
                .coordinator
                .run_all(&cancel, self.realtime_threshold)
                .await
            {
                Ok(()) => info!(
                    cycle = cycles,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "sync cycle complete"
                ),
                Err(SyncError::Cancelled) => {
                    info!(cycle = cycles, "cycle interrupted by shutdown");
                    break;
                }
                Err(e) => error!(cycle = cycles, error = %e, "sync cycle failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.loop_interval) => {}
            }
        }

        info!(cycles, "supervisor stopped");
        cycles
    }
}
