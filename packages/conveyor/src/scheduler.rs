//! Scheduler service: promotes due jobs and reclaims expired leases.
//!
//! A single logical loop. Each tick scans `jobs:scheduled` for members
//! whose run time has arrived and enqueues them, then scans `jobs:lease`
//! for expired leases and recycles them through the engine. Work per tick
//! is bounded; whatever does not fit is picked up on the next tick. Index
//! scans run in ascending score order, and jobs with equal scores may be
//! processed in any order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::time::now_ms;
use crate::engine::{Engine, TransitionOutcome};
use crate::error::QueueError;
use crate::keys;
use crate::record::JobState;
use crate::store::Store;

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between ticks.
    pub tick_interval: Duration,
    /// Maximum due jobs promoted per tick.
    pub promote_batch: usize,
    /// Maximum expired leases reclaimed per tick.
    pub reclaim_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            promote_batch: 100,
            reclaim_batch: 100,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Jobs promoted `scheduled -> queued`.
    pub promoted: usize,
    /// Expired leases recycled back into the delay wheel.
    pub reclaimed: usize,
    /// Expired leases that had no retry budget left and went to `failed`.
    pub failed: usize,
}

impl TickSummary {
    pub fn is_idle(&self) -> bool {
        self.promoted == 0 && self.reclaimed == 0 && self.failed == 0
    }
}

/// Background service driving the delay wheel and lease reclamation.
pub struct Scheduler<S: Store> {
    engine: Arc<Engine<S>>,
    store: Arc<S>,
    config: SchedulerConfig,
}

impl<S: Store> Scheduler<S> {
    pub fn new(engine: Arc<Engine<S>>, store: Arc<S>) -> Self {
        Self::with_config(engine, store, SchedulerConfig::default())
    }

    pub fn with_config(engine: Arc<Engine<S>>, store: Arc<S>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }

    /// One promote + reclaim pass.
    pub async fn tick(&self) -> Result<TickSummary, QueueError> {
        let now = now_ms();
        let mut summary = TickSummary::default();

        let due = self
            .store
            .zset_range_by_score(keys::JOBS_SCHEDULED, now, self.config.promote_batch)
            .await?;
        for job_id in due {
            match self.engine.enqueue(&job_id).await? {
                TransitionOutcome::Applied(_) => summary.promoted += 1,
                TransitionOutcome::Skipped(reason) => {
                    debug!(job_id = %job_id, ?reason, "promotion lost its race");
                }
            }
        }

        let expired = self
            .store
            .zset_range_by_score(keys::JOBS_LEASE, now, self.config.reclaim_batch)
            .await?;
        for job_id in expired {
            match self.engine.reclaim_expired(&job_id).await? {
                TransitionOutcome::Applied(record) if record.state == JobState::Failed => {
                    warn!(job_id = %job_id, attempts = record.attempts, "lease expired with no retry budget left");
                    summary.failed += 1;
                }
                TransitionOutcome::Applied(record) => {
                    debug!(job_id = %job_id, attempts = record.attempts, run_at_ms = ?record.run_at_ms, "expired lease recycled");
                    summary.reclaimed += 1;
                }
                TransitionOutcome::Skipped(reason) => {
                    debug!(job_id = %job_id, ?reason, "reclaim lost its race");
                }
            }
        }

        Ok(summary)
    }

    /// Run ticks until shutdown is requested. Store trouble is logged and
    /// retried after a short back-off; the loop itself never dies.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            promote_batch = self.config.promote_batch,
            "scheduler starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.tick().await {
                Ok(summary) if !summary.is_idle() => {
                    debug!(
                        promoted = summary.promoted,
                        reclaimed = summary.reclaimed,
                        failed = summary.failed,
                        "tick moved jobs"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "scheduler tick failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }

        info!("scheduler stopped");
        Ok(())
    }
}
