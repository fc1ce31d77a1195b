//! Error types for the queue core.
//!
//! Lost races are not errors: a guarded transition that finds the record
//! gone or in a different state reports a successful no-op through
//! [`crate::engine::TransitionOutcome`]. The enums here cover the cases a
//! caller must actually handle.

use thiserror::Error;

use crate::record::JobState;

/// Failure talking to the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached, or a command failed mid-flight.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A stored job hash that could not be decoded into a record.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid `{field}` value {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Errors surfaced by the transition engine and the loops built on it.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A transition outside the legal table was requested. This is a
    /// programmer error and is never masked.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    /// Optimistic commits kept colliding with concurrent writers past the
    /// retry budget.
    #[error("job {job_id}: transaction conflicted {attempts} times, giving up")]
    ConflictExhausted { job_id: String, attempts: u32 },

    /// The job hash exists but does not decode into a record.
    #[error("job {job_id}: corrupt record")]
    CorruptRecord {
        job_id: String,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
