//! State-transition engine.
//!
//! Every mutation of a job record or its index memberships flows through
//! one guarded primitive: read the record under a watch on `job:{id}`,
//! check the expected state, check the legal-transition table, and commit
//! the new record value together with a declarative index delta in a
//! single transaction. A watch conflict retries with a short pause; a
//! record that is gone or in a different state is a lost race and reports
//! a successful no-op.
//!
//! ```text
//! submitter ─► schedule ──► jobs:scheduled
//! scheduler ─► enqueue ───► jobs:ready
//! worker ────► lease ─────► jobs:lease ──► complete / fail_permanent
//!                                      └─► requeue_for_retry ─► jobs:scheduled
//! scheduler ─► reclaim_expired ───────────► jobs:scheduled (or failed)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::common::time::now_ms;
use crate::error::QueueError;
use crate::keys;
use crate::record::{JobRecord, JobState, ScheduleOptions, OPTIONAL_FIELDS};
use crate::store::{CommitOutcome, Store, StoreOp, StoreTx};

/// Legal state transitions. `running -> scheduled` is the retry edge used
/// by both the worker's requeue and the lease reclaimer.
pub const LEGAL_TRANSITIONS: &[(JobState, JobState)] = &[
    (JobState::Scheduled, JobState::Queued),
    (JobState::Scheduled, JobState::Canceled),
    (JobState::Queued, JobState::Running),
    (JobState::Queued, JobState::Canceled),
    (JobState::Running, JobState::Completed),
    (JobState::Running, JobState::Failed),
    (JobState::Running, JobState::Queued),
    (JobState::Running, JobState::Scheduled),
];

pub fn transition_is_legal(from: JobState, to: JobState) -> bool {
    LEGAL_TRANSITIONS.contains(&(from, to))
}

/// The three secondary indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobIndex {
    Scheduled,
    Ready,
    Lease,
}

/// An index insertion, carrying the score where the index is ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEntry {
    Scheduled { run_at_ms: i64 },
    Ready,
    Lease { expires_at_ms: i64 },
}

/// Index memberships to drop and add alongside a record write. Applied
/// inside the same transaction as the record itself.
#[derive(Debug, Clone, Default)]
pub struct IndexDelta {
    pub remove: Vec<JobIndex>,
    pub add: Vec<IndexEntry>,
}

/// How a guarded transition ended.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The transition committed; this is the record as written.
    Applied(JobRecord),
    /// The race was lost; nothing was written.
    Skipped(SkipReason),
}

impl TransitionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The job hash disappeared between scan and transaction.
    Missing,
    /// Another writer moved the job out of the expected state first.
    StateMismatch { actual: JobState },
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a lease lasts before the reclaimer may recycle the job.
    pub lease_duration_ms: i64,
    /// Watch-conflict retries per call before giving up.
    pub conflict_retry_limit: u32,
    /// Pause between conflict retries.
    pub conflict_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: 30_000,
            conflict_retry_limit: 16,
            conflict_retry_delay: Duration::from_millis(5),
        }
    }
}

/// The sole writer of job state.
pub struct Engine<S: Store> {
    store: Arc<S>,
    config: EngineConfig,
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a job in `scheduled` state and index it by its run time.
    ///
    /// Creation has no prior state to guard, so this writes the full hash
    /// and the index entry in one transaction. Submitting an id twice is
    /// last-write-wins on the record.
    pub async fn schedule(&self, options: ScheduleOptions) -> Result<JobRecord, QueueError> {
        let now = now_ms();
        let run_at = options.run_at_ms.unwrap_or(now);
        let record = JobRecord {
            id: options.job_id,
            state: JobState::Scheduled,
            task: options.task,
            payload: options.payload,
            attempts: 0,
            max_retries: options.max_retries,
            backoff_base_ms: options.backoff_base_ms,
            run_at_ms: Some(run_at),
            created_at_ms: now,
            updated_at_ms: now,
            lease_owner: None,
            lease_expires_at_ms: None,
            last_error: None,
        };

        let key = keys::job_key(&record.id);
        let ops = vec![
            // Resubmitting an id is last-write-wins; drop any optional
            // fields a previous life of the job left behind.
            StoreOp::HashDel {
                key: key.clone(),
                fields: OPTIONAL_FIELDS.iter().map(|f| f.to_string()).collect(),
            },
            StoreOp::HashSet {
                key: key.clone(),
                fields: record.encode(),
            },
            StoreOp::ZsetAdd {
                key: keys::JOBS_SCHEDULED.to_string(),
                member: record.id.clone(),
                score: run_at,
            },
        ];

        for _ in 0..self.config.conflict_retry_limit {
            let tx = self.store.begin(&key).await?;
            match tx.commit(ops.clone()).await? {
                CommitOutcome::Committed => {
                    debug!(job_id = %record.id, run_at_ms = run_at, "job scheduled");
                    return Ok(record);
                }
                CommitOutcome::Conflict => {
                    tokio::time::sleep(self.config.conflict_retry_delay).await;
                }
            }
        }
        Err(QueueError::ConflictExhausted {
            job_id: record.id,
            attempts: self.config.conflict_retry_limit,
        })
    }

    /// `scheduled -> queued`: the job is due, move it to the ready set.
    pub async fn enqueue(&self, job_id: &str) -> Result<TransitionOutcome, QueueError> {
        self.transition(job_id, JobState::Scheduled, JobState::Queued, |record, _| {
            let delta = IndexDelta {
                remove: vec![JobIndex::Scheduled],
                add: vec![IndexEntry::Ready],
            };
            (record, delta)
        })
        .await
    }

    /// `queued -> running`: grant a lease to `worker_id`.
    ///
    /// Every grant counts an execution attempt, including grants that
    /// follow a reclaimed lease.
    pub async fn lease(
        &self,
        job_id: &str,
        worker_id: &str,
    ) -> Result<TransitionOutcome, QueueError> {
        let lease_ms = self.config.lease_duration_ms;
        let worker = worker_id.to_string();
        self.transition(job_id, JobState::Queued, JobState::Running, move |mut record, now| {
            let expires_at = now + lease_ms;
            record.attempts += 1;
            record.lease_owner = Some(worker.clone());
            record.lease_expires_at_ms = Some(expires_at);
            let delta = IndexDelta {
                remove: vec![JobIndex::Ready],
                add: vec![IndexEntry::Lease { expires_at_ms: expires_at }],
            };
            (record, delta)
        })
        .await
    }

    /// `running -> completed`.
    pub async fn complete(&self, job_id: &str) -> Result<TransitionOutcome, QueueError> {
        self.transition(job_id, JobState::Running, JobState::Completed, |mut record, _| {
            record.lease_owner = None;
            record.lease_expires_at_ms = None;
            let delta = IndexDelta {
                remove: vec![JobIndex::Lease],
                add: Vec::new(),
            };
            (record, delta)
        })
        .await
    }

    /// `running -> failed`, recording why. No retry follows.
    pub async fn fail_permanent(
        &self,
        job_id: &str,
        error: &str,
    ) -> Result<TransitionOutcome, QueueError> {
        let error = error.to_string();
        self.transition(job_id, JobState::Running, JobState::Failed, move |mut record, _| {
            record.lease_owner = None;
            record.lease_expires_at_ms = None;
            record.last_error = Some(error.clone());
            let delta = IndexDelta {
                remove: vec![JobIndex::Lease],
                add: Vec::new(),
            };
            (record, delta)
        })
        .await
    }

    /// `running -> scheduled` after a failed attempt: park the job in the
    /// delay wheel at `now + backoff` so retries share the scheduled
    /// index's timing machinery.
    pub async fn requeue_for_retry(
        &self,
        job_id: &str,
        error: &str,
    ) -> Result<TransitionOutcome, QueueError> {
        let error = error.to_string();
        self.transition(job_id, JobState::Running, JobState::Scheduled, move |mut record, now| {
            let run_at = now + record.retry_backoff_ms() as i64;
            record.lease_owner = None;
            record.lease_expires_at_ms = None;
            record.last_error = Some(error.clone());
            record.run_at_ms = Some(run_at);
            let delta = IndexDelta {
                remove: vec![JobIndex::Lease],
                add: vec![IndexEntry::Scheduled { run_at_ms: run_at }],
            };
            (record, delta)
        })
        .await
    }

    /// Recycle a job whose lease expired: back to the delay wheel with
    /// backoff while retry budget remains, else permanently failed.
    ///
    /// The fail-or-reschedule decision reads the record first, but both
    /// branches are still guarded on `running`; if anything moved the job
    /// meanwhile the branch lands as a no-op. `attempts` cannot change
    /// while the state stays `running`, so the decision never goes stale.
    pub async fn reclaim_expired(&self, job_id: &str) -> Result<TransitionOutcome, QueueError> {
        let Some(record) = self.load(job_id).await? else {
            return Ok(TransitionOutcome::Skipped(SkipReason::Missing));
        };
        if record.state != JobState::Running {
            return Ok(TransitionOutcome::Skipped(SkipReason::StateMismatch {
                actual: record.state,
            }));
        }

        if record.attempts > record.max_retries {
            return self
                .fail_permanent(job_id, "lease expired; retries exhausted")
                .await;
        }

        self.transition(job_id, JobState::Running, JobState::Scheduled, |mut record, now| {
            let run_at = now + record.retry_backoff_ms() as i64;
            record.lease_owner = None;
            record.lease_expires_at_ms = None;
            record.run_at_ms = Some(run_at);
            let delta = IndexDelta {
                remove: vec![JobIndex::Lease],
                add: vec![IndexEntry::Scheduled { run_at_ms: run_at }],
            };
            (record, delta)
        })
        .await
    }

    /// Cancel a job that has not started running. Tries
    /// `scheduled -> canceled` first, then `queued -> canceled`; a running
    /// job is left alone. Returns whether either transition applied.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        let outcome = self
            .transition(job_id, JobState::Scheduled, JobState::Canceled, |record, _| {
                let delta = IndexDelta {
                    remove: vec![JobIndex::Scheduled],
                    add: Vec::new(),
                };
                (record, delta)
            })
            .await?;
        if outcome.applied() {
            return Ok(true);
        }

        let outcome = self
            .transition(job_id, JobState::Queued, JobState::Canceled, |record, _| {
                let delta = IndexDelta {
                    remove: vec![JobIndex::Ready],
                    add: Vec::new(),
                };
                (record, delta)
            })
            .await?;
        Ok(outcome.applied())
    }

    /// Read and decode the current record, if any.
    pub async fn load(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError> {
        let key = keys::job_key(job_id);
        match self.store.hash_get_all(&key).await? {
            None => Ok(None),
            Some(raw) => JobRecord::decode(&raw)
                .map(Some)
                .map_err(|source| QueueError::CorruptRecord {
                    job_id: job_id.to_string(),
                    source,
                }),
        }
    }

    /// The guarded atomic primitive.
    ///
    /// `plan` receives the record with `state` and `updated_at_ms` already
    /// advanced and returns the value to commit plus the index delta. It
    /// may run more than once if the commit keeps conflicting.
    async fn transition<F>(
        &self,
        job_id: &str,
        expected: JobState,
        next: JobState,
        plan: F,
    ) -> Result<TransitionOutcome, QueueError>
    where
        F: Fn(JobRecord, i64) -> (JobRecord, IndexDelta),
    {
        let key = keys::job_key(job_id);

        for attempt in 0..self.config.conflict_retry_limit {
            let mut tx = self.store.begin(&key).await?;

            let Some(raw) = tx.hash_get_all(&key).await? else {
                tx.abort().await?;
                return Ok(TransitionOutcome::Skipped(SkipReason::Missing));
            };
            let record =
                JobRecord::decode(&raw).map_err(|source| QueueError::CorruptRecord {
                    job_id: job_id.to_string(),
                    source,
                })?;

            if record.state != expected {
                tx.abort().await?;
                return Ok(TransitionOutcome::Skipped(SkipReason::StateMismatch {
                    actual: record.state,
                }));
            }
            if !transition_is_legal(record.state, next) {
                tx.abort().await?;
                return Err(QueueError::IllegalTransition {
                    from: record.state,
                    to: next,
                });
            }

            // Clamp so updated_at_ms stays monotonic even if the clock
            // steps backwards between transitions.
            let now = now_ms().max(record.updated_at_ms);
            let mut staged = record;
            staged.state = next;
            staged.updated_at_ms = now;
            let (next_record, delta) = plan(staged, now);

            let mut ops = record_ops(&key, &raw, &next_record);
            ops.extend(index_ops(job_id, &delta));

            match tx.commit(ops).await? {
                CommitOutcome::Committed => {
                    debug!(job_id, from = %expected, to = %next, "transition committed");
                    return Ok(TransitionOutcome::Applied(next_record));
                }
                CommitOutcome::Conflict => {
                    debug!(job_id, attempt, "transition hit a concurrent writer, retrying");
                    tokio::time::sleep(self.config.conflict_retry_delay).await;
                }
            }
        }

        Err(QueueError::ConflictExhausted {
            job_id: job_id.to_string(),
            attempts: self.config.conflict_retry_limit,
        })
    }
}

/// Write the new record value: one HSET for everything present, one HDEL
/// for optional fields the new value dropped.
fn record_ops(
    key: &str,
    before: &HashMap<String, String>,
    after: &JobRecord,
) -> Vec<StoreOp> {
    let fields = after.encode();
    let cleared: Vec<String> = OPTIONAL_FIELDS
        .iter()
        .filter(|field| {
            before.contains_key(**field) && !fields.iter().any(|(name, _)| name == *field)
        })
        .map(|field| (*field).to_string())
        .collect();

    let mut ops = vec![StoreOp::HashSet {
        key: key.to_string(),
        fields,
    }];
    if !cleared.is_empty() {
        ops.push(StoreOp::HashDel {
            key: key.to_string(),
            fields: cleared,
        });
    }
    ops
}

fn index_ops(job_id: &str, delta: &IndexDelta) -> Vec<StoreOp> {
    let mut ops = Vec::with_capacity(delta.remove.len() + delta.add.len());
    for index in &delta.remove {
        ops.push(match index {
            JobIndex::Scheduled => StoreOp::ZsetRem {
                key: keys::JOBS_SCHEDULED.to_string(),
                member: job_id.to_string(),
            },
            JobIndex::Ready => StoreOp::SetRem {
                key: keys::JOBS_READY.to_string(),
                member: job_id.to_string(),
            },
            JobIndex::Lease => StoreOp::ZsetRem {
                key: keys::JOBS_LEASE.to_string(),
                member: job_id.to_string(),
            },
        });
    }
    for entry in &delta.add {
        ops.push(match entry {
            IndexEntry::Scheduled { run_at_ms } => StoreOp::ZsetAdd {
                key: keys::JOBS_SCHEDULED.to_string(),
                member: job_id.to_string(),
                score: *run_at_ms,
            },
            IndexEntry::Ready => StoreOp::SetAdd {
                key: keys::JOBS_READY.to_string(),
                member: job_id.to_string(),
            },
            IndexEntry::Lease { expires_at_ms } => StoreOp::ZsetAdd {
                key: keys::JOBS_LEASE.to_string(),
                member: job_id.to_string(),
                score: *expires_at_ms,
            },
        });
    }
    ops
}
