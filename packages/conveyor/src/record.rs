//! Job model and hash-field codec.
//!
//! A [`JobRecord`] is an immutable snapshot of the `job:{id}` hash; every
//! state change produces a new value that the engine commits atomically.
//! The codec writes enum states as their canonical lower-case names,
//! numbers as ASCII decimal, and the payload as a JSON string. Reads
//! tolerate unknown extra fields so old nodes can coexist with newer
//! record layouts.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::DecodeError;

/// Retry delays stop doubling once they reach this many milliseconds.
pub const BACKOFF_CAP_MS: u64 = 60_000;

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Scheduled,
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    /// Terminal states stay in the store for observability but leave all
    /// active indices.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(JobState::Scheduled),
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "canceled" => Some(JobState::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Field names
// ============================================================================

/// Hash field names of the `job:{id}` record.
pub mod fields {
    pub const ID: &str = "id";
    pub const STATE: &str = "state";
    pub const TASK: &str = "task";
    pub const PAYLOAD: &str = "payload";
    pub const ATTEMPTS: &str = "attempts";
    pub const MAX_RETRIES: &str = "max_retries";
    pub const BACKOFF_BASE_MS: &str = "backoff_base_ms";
    pub const RUN_AT_MS: &str = "run_at_ms";
    pub const CREATED_AT_MS: &str = "created_at_ms";
    pub const UPDATED_AT_MS: &str = "updated_at_ms";
    pub const LEASE_OWNER: &str = "lease_owner";
    pub const LEASE_EXPIRES_AT_MS: &str = "lease_expires_at_ms";
    pub const LAST_ERROR: &str = "last_error";
}

/// Fields that are present only in some states; a committed transition
/// deletes the ones its new record no longer carries.
pub const OPTIONAL_FIELDS: &[&str] = &[
    fields::RUN_AT_MS,
    fields::LEASE_OWNER,
    fields::LEASE_EXPIRES_AT_MS,
    fields::LAST_ERROR,
];

// ============================================================================
// Record
// ============================================================================

/// Authoritative per-job record, one hash per job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub state: JobState,

    /// Task name, resolved through the registry at execution time.
    pub task: String,
    /// Opaque to the engine; handed to the task callback verbatim.
    pub payload: serde_json::Value,

    /// Number of lease grants so far. Bounded by `max_retries + 1`.
    pub attempts: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,

    pub run_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,

    /// Present exactly while `state == running`.
    pub lease_owner: Option<String>,
    pub lease_expires_at_ms: Option<i64>,

    pub last_error: Option<String>,
}

impl JobRecord {
    /// Encode into hash field/value pairs. Absent optional fields are
    /// omitted rather than written as sentinels.
    pub fn encode(&self) -> Vec<(String, String)> {
        let mut out = vec![
            (fields::ID.to_string(), self.id.clone()),
            (fields::STATE.to_string(), self.state.to_string()),
            (fields::TASK.to_string(), self.task.clone()),
            (fields::PAYLOAD.to_string(), self.payload.to_string()),
            (fields::ATTEMPTS.to_string(), self.attempts.to_string()),
            (fields::MAX_RETRIES.to_string(), self.max_retries.to_string()),
            (
                fields::BACKOFF_BASE_MS.to_string(),
                self.backoff_base_ms.to_string(),
            ),
            (
                fields::CREATED_AT_MS.to_string(),
                self.created_at_ms.to_string(),
            ),
            (
                fields::UPDATED_AT_MS.to_string(),
                self.updated_at_ms.to_string(),
            ),
        ];

        if let Some(run_at) = self.run_at_ms {
            out.push((fields::RUN_AT_MS.to_string(), run_at.to_string()));
        }
        if let Some(owner) = &self.lease_owner {
            out.push((fields::LEASE_OWNER.to_string(), owner.clone()));
        }
        if let Some(expires) = self.lease_expires_at_ms {
            out.push((fields::LEASE_EXPIRES_AT_MS.to_string(), expires.to_string()));
        }
        if let Some(error) = &self.last_error {
            out.push((fields::LAST_ERROR.to_string(), error.clone()));
        }

        out
    }

    /// Decode from hash fields. Unknown fields are ignored.
    pub fn decode(raw: &HashMap<String, String>) -> Result<Self, DecodeError> {
        let state_raw = require(raw, fields::STATE)?;
        let state = JobState::parse(state_raw).ok_or_else(|| DecodeError::InvalidField {
            field: fields::STATE,
            value: state_raw.to_string(),
        })?;

        let payload_raw = require(raw, fields::PAYLOAD)?;
        let payload =
            serde_json::from_str(payload_raw).map_err(|_| DecodeError::InvalidField {
                field: fields::PAYLOAD,
                value: payload_raw.to_string(),
            })?;

        Ok(Self {
            id: require(raw, fields::ID)?.to_string(),
            state,
            task: require(raw, fields::TASK)?.to_string(),
            payload,
            attempts: parse_field(raw, fields::ATTEMPTS)?,
            max_retries: parse_field(raw, fields::MAX_RETRIES)?,
            backoff_base_ms: parse_field(raw, fields::BACKOFF_BASE_MS)?,
            run_at_ms: parse_optional(raw, fields::RUN_AT_MS)?,
            created_at_ms: parse_field(raw, fields::CREATED_AT_MS)?,
            updated_at_ms: parse_field(raw, fields::UPDATED_AT_MS)?,
            lease_owner: raw.get(fields::LEASE_OWNER).cloned(),
            lease_expires_at_ms: parse_optional(raw, fields::LEASE_EXPIRES_AT_MS)?,
            last_error: raw.get(fields::LAST_ERROR).cloned(),
        })
    }

    /// Delay before the next execution attempt: `backoff_base_ms`
    /// doubling per prior attempt, capped at [`BACKOFF_CAP_MS`].
    pub fn retry_backoff_ms(&self) -> u64 {
        let exponent = self.attempts.saturating_sub(1).min(32);
        self.backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(BACKOFF_CAP_MS)
    }
}

fn require<'a>(
    raw: &'a HashMap<String, String>,
    field: &'static str,
) -> Result<&'a str, DecodeError> {
    raw.get(field)
        .map(String::as_str)
        .ok_or(DecodeError::MissingField(field))
}

fn parse_field<T: FromStr>(
    raw: &HashMap<String, String>,
    field: &'static str,
) -> Result<T, DecodeError> {
    let value = require(raw, field)?;
    value.parse().map_err(|_| DecodeError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_optional<T: FromStr>(
    raw: &HashMap<String, String>,
    field: &'static str,
) -> Result<Option<T>, DecodeError> {
    match raw.get(field) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| DecodeError::InvalidField {
                field,
                value: value.to_string(),
            }),
    }
}

// ============================================================================
// Submission options
// ============================================================================

/// Options for submitting a job.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScheduleOptions {
    /// Caller-supplied unique id. Submitting the same id twice is
    /// last-write-wins on the record.
    pub job_id: String,
    /// The task name (must match a registered handler at execution time).
    pub task: String,
    #[builder(default = serde_json::Value::Object(serde_json::Map::new()))]
    pub payload: serde_json::Value,
    /// Earliest execution time. If absent, the job is due immediately.
    #[builder(default, setter(strip_option))]
    pub run_at_ms: Option<i64>,
    #[builder(default = 5)]
    pub max_retries: u32,
    #[builder(default = 500)]
    pub backoff_base_ms: u64,
}

impl ScheduleOptions {
    /// One-off job that runs as soon as a worker is free.
    pub fn immediate(
        job_id: impl Into<String>,
        task: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::builder().job_id(job_id).task(task).payload(payload).build()
    }

    /// Job held back until `run_at_ms`.
    pub fn at(
        job_id: impl Into<String>,
        task: impl Into<String>,
        payload: serde_json::Value,
        run_at_ms: i64,
    ) -> Self {
        Self::builder()
            .job_id(job_id)
            .task(task)
            .payload(payload)
            .run_at_ms(run_at_ms)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> JobRecord {
        JobRecord {
            id: "job-1".to_string(),
            state: JobState::Running,
            task: "task.echo".to_string(),
            payload: json!({"m": "hi"}),
            attempts: 2,
            max_retries: 5,
            backoff_base_ms: 500,
            run_at_ms: Some(1_700_000_000_000),
            created_at_ms: 1_700_000_000_000,
            updated_at_ms: 1_700_000_000_500,
            lease_owner: Some("worker-1".to_string()),
            lease_expires_at_ms: Some(1_700_000_030_000),
            last_error: Some("attempt 1 flaked".to_string()),
        }
    }

    fn as_map(pairs: Vec<(String, String)>) -> HashMap<String, String> {
        pairs.into_iter().collect()
    }

    #[test]
    fn codec_round_trips_full_record() {
        let record = sample_record();
        let decoded = JobRecord::decode(&as_map(record.encode())).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn codec_round_trips_minimal_record() {
        let record = JobRecord {
            run_at_ms: None,
            lease_owner: None,
            lease_expires_at_ms: None,
            last_error: None,
            state: JobState::Completed,
            attempts: 1,
            ..sample_record()
        };
        let encoded = record.encode();
        assert!(!encoded.iter().any(|(k, _)| k == fields::LEASE_OWNER));
        let decoded = JobRecord::decode(&as_map(encoded)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_tolerates_unknown_fields() {
        let mut raw = as_map(sample_record().encode());
        raw.insert("shard_hint".to_string(), "7".to_string());
        let decoded = JobRecord::decode(&raw).unwrap();
        assert_eq!(decoded, sample_record());
    }

    #[test]
    fn decode_rejects_missing_state() {
        let mut raw = as_map(sample_record().encode());
        raw.remove(fields::STATE);
        assert!(matches!(
            JobRecord::decode(&raw),
            Err(DecodeError::MissingField(f)) if f == fields::STATE
        ));
    }

    #[test]
    fn decode_rejects_bad_attempts() {
        let mut raw = as_map(sample_record().encode());
        raw.insert(fields::ATTEMPTS.to_string(), "many".to_string());
        assert!(matches!(
            JobRecord::decode(&raw),
            Err(DecodeError::InvalidField { field, .. }) if field == fields::ATTEMPTS
        ));
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            JobState::Scheduled,
            JobState::Queued,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
            JobState::Canceled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("paused"), None);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let mut record = sample_record();
        record.backoff_base_ms = 100;
        record.attempts = 1;
        assert_eq!(record.retry_backoff_ms(), 100);
        record.attempts = 2;
        assert_eq!(record.retry_backoff_ms(), 200);
        record.attempts = 4;
        assert_eq!(record.retry_backoff_ms(), 800);
    }

    #[test]
    fn backoff_is_capped() {
        let mut record = sample_record();
        record.backoff_base_ms = 500;
        record.attempts = 30;
        assert_eq!(record.retry_backoff_ms(), BACKOFF_CAP_MS);
    }

    #[test]
    fn schedule_options_defaults() {
        let options = ScheduleOptions::immediate("job-1", "task.echo", json!({}));
        assert_eq!(options.max_retries, 5);
        assert_eq!(options.backoff_base_ms, 500);
        assert!(options.run_at_ms.is_none());
    }
}
