//! Store contract consumed by the engine and the polling loops.
//!
//! The engine needs a small slice of a key/value store: hashes for job
//! records, sorted sets and a plain set for the indices, and multi-key
//! transactions guarded by an optimistic watch on a single key. Everything
//! here maps one-to-one onto Redis commands, but the contract is kept
//! abstract so the test suite can run against [`MemoryStore`] with the same
//! concurrency semantics.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;

/// One write inside a transaction. Deletions come before insertions when
/// the engine builds a batch, but the batch commits as a whole either way.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HashDel {
        key: String,
        fields: Vec<String>,
    },
    ZsetAdd {
        key: String,
        member: String,
        score: i64,
    },
    ZsetRem {
        key: String,
        member: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRem {
        key: String,
        member: String,
    },
}

/// Result of attempting to commit a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Another writer touched the watched key; nothing was applied.
    Conflict,
}

/// An open transaction watching a single key.
///
/// Reads made through the transaction see live data; the commit succeeds
/// only if the watched key is unchanged since [`Store::begin`].
#[async_trait]
pub trait StoreTx: Send {
    /// All fields of the hash at `key`, or `None` if it does not exist.
    async fn hash_get_all(
        &mut self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError>;

    /// Apply every op atomically, or none of them on a watch conflict.
    async fn commit(self, ops: Vec<StoreOp>) -> Result<CommitOutcome, StoreError>;

    /// Release the watch without writing anything.
    async fn abort(self) -> Result<(), StoreError>;
}

/// Minimal store surface.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx;

    /// Open a transaction watching `watch_key`.
    async fn begin(&self, watch_key: &str) -> Result<Self::Tx, StoreError>;

    /// All fields of the hash at `key`, or `None` if it does not exist.
    async fn hash_get_all(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError>;

    /// Up to `limit` members of the sorted set at `key` with score at most
    /// `max_score`, in ascending score order.
    async fn zset_range_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Atomically remove and return an arbitrary member of the set at
    /// `key`.
    async fn set_pop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Add `member` to the set at `key`.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;
}
