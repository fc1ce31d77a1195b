//! Worker service: claims ready jobs and executes task callbacks.
//!
//! The loop pops an arbitrary member of `jobs:ready`, takes a lease on it
//! through the engine, resolves the task through the registry, runs the
//! callback, and reports the outcome back through the engine. Execution is
//! at-least-once: a worker that dies mid-task loses its lease and the
//! scheduler recycles the job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{Engine, SkipReason, TransitionOutcome};
use crate::error::QueueError;
use crate::keys;
use crate::record::{JobRecord, JobState};
use crate::registry::SharedTaskRegistry;
use crate::store::Store;

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identity recorded as the lease owner.
    pub worker_id: String,
    /// How long to wait when the ready set is empty.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl WorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// A worker that executes jobs from the ready set.
pub struct Worker<S: Store> {
    engine: Arc<Engine<S>>,
    store: Arc<S>,
    registry: SharedTaskRegistry,
    config: WorkerConfig,
}

impl<S: Store> Worker<S> {
    pub fn new(engine: Arc<Engine<S>>, store: Arc<S>, registry: SharedTaskRegistry) -> Self {
        Self::with_config(engine, store, registry, WorkerConfig::default())
    }

    pub fn with_config(
        engine: Arc<Engine<S>>,
        store: Arc<S>,
        registry: SharedTaskRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            engine,
            store,
            registry,
            config,
        }
    }

    /// Claim and execute at most one job. Returns whether a ready id was
    /// popped at all, so callers know when to sleep.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(job_id) = self.store.set_pop(keys::JOBS_READY).await? else {
            return Ok(false);
        };

        let record = match self.engine.lease(&job_id, &self.config.worker_id).await {
            Ok(TransitionOutcome::Applied(record)) => record,
            Ok(TransitionOutcome::Skipped(reason)) => {
                // Lost the claim race. Whichever transition won has already
                // put the indices right, so the popped id is simply stale.
                debug!(job_id = %job_id, ?reason, "lease skipped");
                if matches!(reason, SkipReason::StateMismatch { actual: JobState::Queued }) {
                    // Still queued means nobody owns it; give it back.
                    self.store.set_add(keys::JOBS_READY, &job_id).await?;
                }
                return Ok(true);
            }
            Err(e) => {
                // Transient store trouble: the job is still queued but no
                // longer in the ready set, so put the id back before
                // surfacing the error.
                self.store.set_add(keys::JOBS_READY, &job_id).await?;
                return Err(e);
            }
        };

        self.execute(record).await?;
        Ok(true)
    }

    /// Run the callback for a leased job and report the outcome.
    async fn execute(&self, record: JobRecord) -> Result<(), QueueError> {
        let job_id = record.id.clone();
        let task = record.task.clone();

        let Some(callback) = self.registry.task(&task) else {
            warn!(job_id = %job_id, task = %task, "no handler registered");
            self.engine
                .fail_permanent(&job_id, &format!("unknown task: {task}"))
                .await?;
            return Ok(());
        };

        debug!(job_id = %job_id, task = %task, attempt = record.attempts, "executing task");
        match callback(record.payload.clone()).await {
            Ok(()) => {
                info!(job_id = %job_id, task = %task, "task completed");
                self.engine.complete(&job_id).await?;
            }
            Err(e) => {
                let message = e.to_string();
                if record.attempts <= record.max_retries {
                    warn!(
                        job_id = %job_id,
                        task = %task,
                        attempt = record.attempts,
                        error = %message,
                        "task failed, scheduling retry"
                    );
                    self.engine.requeue_for_retry(&job_id, &message).await?;
                } else {
                    warn!(
                        job_id = %job_id,
                        task = %task,
                        attempt = record.attempts,
                        error = %message,
                        "task failed with retry budget exhausted"
                    );
                    self.engine.fail_permanent(&job_id, &message).await?;
                }
            }
        }

        Ok(())
    }

    /// Run until shutdown is requested. Store trouble is logged and
    /// retried after a short back-off; the loop itself never dies.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                // Something was popped; look for more right away.
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "worker iteration failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{JobState, ScheduleOptions};
    use crate::registry::TaskRegistry;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixture(registry: TaskRegistry) -> (Arc<MemoryStore>, Arc<Engine<MemoryStore>>, Worker<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(Engine::new(store.clone()));
        let worker = Worker::with_config(
            engine.clone(),
            store.clone(),
            Arc::new(registry),
            WorkerConfig::with_worker_id("worker-test"),
        );
        (store, engine, worker)
    }

    #[test]
    fn config_defaults() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.poll_interval, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn run_once_with_empty_ready_set_does_nothing() {
        let (_, _, worker) = fixture(TaskRegistry::new());
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn run_once_completes_a_ready_job() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut registry = TaskRegistry::new();
        registry.register("task.echo", move |payload| {
            let seen = seen.clone();
            async move {
                anyhow::ensure!(payload["m"] == "hi");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (store, engine, worker) = fixture(registry);
        engine
            .schedule(ScheduleOptions::immediate("a", "task.echo", json!({"m": "hi"})))
            .await
            .unwrap();
        engine.enqueue("a").await.unwrap();

        assert!(worker.run_once().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let record = engine.load("a").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.lease_owner, None);
        assert!(!store.set_contains(keys::JOBS_READY, "a").await);
        assert!(!store.zset_contains(keys::JOBS_LEASE, "a").await);
    }

    #[tokio::test]
    async fn unknown_task_fails_permanently() {
        let (_, engine, worker) = fixture(TaskRegistry::new());
        engine
            .schedule(ScheduleOptions::immediate("a", "task.mystery", json!({})))
            .await
            .unwrap();
        engine.enqueue("a").await.unwrap();

        assert!(worker.run_once().await.unwrap());
        let record = engine.load("a").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(
            record.last_error.as_deref(),
            Some("unknown task: task.mystery")
        );
    }

    #[tokio::test]
    async fn failing_task_is_requeued_with_backoff() {
        let mut registry = TaskRegistry::new();
        registry.register("task.flaky", |_| async move {
            anyhow::bail!("boom")
        });

        let (store, engine, worker) = fixture(registry);
        engine
            .schedule(
                ScheduleOptions::builder()
                    .job_id("a")
                    .task("task.flaky")
                    .backoff_base_ms(50u64)
                    .build(),
            )
            .await
            .unwrap();
        engine.enqueue("a").await.unwrap();

        assert!(worker.run_once().await.unwrap());
        let record = engine.load("a").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Scheduled);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert!(store.zset_contains(keys::JOBS_SCHEDULED, "a").await);
    }

    #[tokio::test]
    async fn failing_task_out_of_budget_fails_permanently() {
        let mut registry = TaskRegistry::new();
        registry.register("task.flaky", |_| async move {
            anyhow::bail!("boom")
        });

        let (_, engine, worker) = fixture(registry);
        engine
            .schedule(
                ScheduleOptions::builder()
                    .job_id("a")
                    .task("task.flaky")
                    .max_retries(0u32)
                    .build(),
            )
            .await
            .unwrap();
        engine.enqueue("a").await.unwrap();

        assert!(worker.run_once().await.unwrap());
        let record = engine.load("a").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn stale_ready_id_for_a_canceled_job_is_dropped() {
        let (store, engine, worker) = fixture(TaskRegistry::new());
        engine
            .schedule(ScheduleOptions::immediate("a", "task.echo", json!({})))
            .await
            .unwrap();
        engine.enqueue("a").await.unwrap();
        engine.cancel("a").await.unwrap();

        // Simulate the pop-vs-cancel race: the id lingers in ready even
        // though the job is already terminal.
        store.set_add(keys::JOBS_READY, "a").await.unwrap();

        assert!(worker.run_once().await.unwrap());
        assert!(!store.set_contains(keys::JOBS_READY, "a").await);
        assert_eq!(
            engine.load("a").await.unwrap().unwrap().state,
            JobState::Canceled
        );
    }
}
