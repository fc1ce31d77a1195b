//! Test support utilities.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::engine::Engine;
use crate::record::{JobRecord, JobState};
use crate::store::Store;

/// Poll until the job reaches `state`, or fail after `timeout`.
pub async fn wait_for_state<S: Store>(
    engine: &Engine<S>,
    job_id: &str,
    state: JobState,
    timeout: Duration,
) -> Result<JobRecord> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let record = engine.load(job_id).await?;
        if let Some(record) = &record {
            if record.state == state {
                return Ok(record.clone());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "job {job_id} did not reach {state} within {timeout:?} (last seen: {:?})",
                record.map(|r| r.state)
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until the job reaches any terminal state, or fail after `timeout`.
pub async fn wait_until_terminal<S: Store>(
    engine: &Engine<S>,
    job_id: &str,
    timeout: Duration,
) -> Result<JobRecord> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let record = engine.load(job_id).await?;
        if let Some(record) = &record {
            if record.state.is_terminal() {
                return Ok(record.clone());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "job {job_id} did not reach a terminal state within {timeout:?} (last seen: {:?})",
                record.map(|r| r.state)
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
