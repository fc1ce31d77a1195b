//! In-process store with the same optimistic-concurrency semantics as the
//! Redis backend.
//!
//! Every key carries a version counter that is bumped on each mutation.
//! A transaction snapshots the watched key's version at `begin` and
//! commits only if it is unchanged, which is how the watch behaves on the
//! wire. The test suite runs entirely against this backend; the extra
//! inspection methods let tests assert index membership directly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::{CommitOutcome, Store, StoreOp, StoreTx};

#[derive(Default)]
struct Shared {
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
    sets: HashMap<String, HashSet<String>>,
    versions: HashMap<String, u64>,
}

impl Shared {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn apply(&mut self, ops: Vec<StoreOp>) {
        for op in ops {
            match op {
                StoreOp::HashSet { key, fields } => {
                    let hash = self.hashes.entry(key.clone()).or_default();
                    for (field, value) in fields {
                        hash.insert(field, value);
                    }
                    self.bump(&key);
                }
                StoreOp::HashDel { key, fields } => {
                    if let Some(hash) = self.hashes.get_mut(&key) {
                        for field in &fields {
                            hash.remove(field);
                        }
                    }
                    self.bump(&key);
                }
                StoreOp::ZsetAdd { key, member, score } => {
                    self.zsets.entry(key.clone()).or_default().insert(member, score);
                    self.bump(&key);
                }
                StoreOp::ZsetRem { key, member } => {
                    if let Some(zset) = self.zsets.get_mut(&key) {
                        zset.remove(&member);
                    }
                    self.bump(&key);
                }
                StoreOp::SetAdd { key, member } => {
                    self.sets.entry(key.clone()).or_default().insert(member);
                    self.bump(&key);
                }
                StoreOp::SetRem { key, member } => {
                    if let Some(set) = self.sets.get_mut(&key) {
                        set.remove(&member);
                    }
                    self.bump(&key);
                }
            }
        }
    }

    fn hash_snapshot(&self, key: &str) -> Option<HashMap<String, String>> {
        self.hashes.get(key).filter(|h| !h.is_empty()).cloned()
    }
}

/// Reference implementation of the store contract.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of a sorted set with their scores, unordered.
    pub async fn zset_members(&self, key: &str) -> Vec<(String, i64)> {
        let shared = self.inner.lock().await;
        shared
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default()
    }

    pub async fn zset_score(&self, key: &str, member: &str) -> Option<i64> {
        let shared = self.inner.lock().await;
        shared.zsets.get(key).and_then(|z| z.get(member).copied())
    }

    pub async fn zset_contains(&self, key: &str, member: &str) -> bool {
        self.zset_score(key, member).await.is_some()
    }

    pub async fn set_members(&self, key: &str) -> Vec<String> {
        let shared = self.inner.lock().await;
        shared
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn set_contains(&self, key: &str, member: &str) -> bool {
        let shared = self.inner.lock().await;
        shared.sets.get(key).is_some_and(|s| s.contains(member))
    }
}

/// Open transaction against a [`MemoryStore`].
pub struct MemoryTx {
    inner: Arc<Mutex<Shared>>,
    watch_key: String,
    observed_version: u64,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn hash_get_all(
        &mut self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError> {
        let shared = self.inner.lock().await;
        Ok(shared.hash_snapshot(key))
    }

    async fn commit(self, ops: Vec<StoreOp>) -> Result<CommitOutcome, StoreError> {
        let mut shared = self.inner.lock().await;
        if shared.version(&self.watch_key) != self.observed_version {
            return Ok(CommitOutcome::Conflict);
        }
        shared.apply(ops);
        Ok(CommitOutcome::Committed)
    }

    async fn abort(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self, watch_key: &str) -> Result<MemoryTx, StoreError> {
        let shared = self.inner.lock().await;
        Ok(MemoryTx {
            inner: self.inner.clone(),
            watch_key: watch_key.to_string(),
            observed_version: shared.version(watch_key),
        })
    }

    async fn hash_get_all(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError> {
        let shared = self.inner.lock().await;
        Ok(shared.hash_snapshot(key))
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let shared = self.inner.lock().await;
        let Some(zset) = shared.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(&String, i64)> = zset
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(member, score)| (member, *score))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(due.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }

    async fn set_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut shared = self.inner.lock().await;
        let Some(set) = shared.sets.get_mut(key) else {
            return Ok(None);
        };
        let member = set.iter().next().cloned();
        if let Some(member) = &member {
            set.remove(member);
            shared.bump(key);
        }
        Ok(member)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut shared = self.inner.lock().await;
        shared
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        shared.bump(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hset(key: &str, field: &str, value: &str) -> StoreOp {
        StoreOp::HashSet {
            key: key.to_string(),
            fields: vec![(field.to_string(), value.to_string())],
        }
    }

    #[tokio::test]
    async fn commit_applies_all_ops() {
        let store = MemoryStore::new();
        let tx = store.begin("job:a").await.unwrap();
        let outcome = tx
            .commit(vec![
                hset("job:a", "state", "scheduled"),
                StoreOp::ZsetAdd {
                    key: "jobs:scheduled".to_string(),
                    member: "a".to_string(),
                    score: 10,
                },
            ])
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        assert!(store.hash_get_all("job:a").await.unwrap().is_some());
        assert_eq!(store.zset_score("jobs:scheduled", "a").await, Some(10));
    }

    #[tokio::test]
    async fn concurrent_write_to_watched_key_conflicts() {
        let store = MemoryStore::new();
        let tx = store.begin("job:a").await.unwrap();

        // Another writer lands on the watched key first.
        let other = store.begin("job:a").await.unwrap();
        other
            .commit(vec![hset("job:a", "state", "queued")])
            .await
            .unwrap();

        let outcome = tx
            .commit(vec![hset("job:a", "state", "running")])
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Conflict);

        let raw = store.hash_get_all("job:a").await.unwrap().unwrap();
        assert_eq!(raw.get("state").map(String::as_str), Some("queued"));
    }

    #[tokio::test]
    async fn write_to_unrelated_key_does_not_conflict() {
        let store = MemoryStore::new();
        let tx = store.begin("job:a").await.unwrap();
        store.set_add("jobs:ready", "b").await.unwrap();
        let outcome = tx
            .commit(vec![hset("job:a", "state", "queued")])
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
    }

    #[tokio::test]
    async fn set_pop_drains_the_set() {
        let store = MemoryStore::new();
        store.set_add("jobs:ready", "a").await.unwrap();
        store.set_add("jobs:ready", "b").await.unwrap();

        let mut popped = Vec::new();
        while let Some(member) = store.set_pop("jobs:ready").await.unwrap() {
            popped.push(member);
        }
        popped.sort();
        assert_eq!(popped, vec!["a".to_string(), "b".to_string()]);
        assert!(store.set_pop("jobs:ready").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zset_range_is_score_ordered_and_bounded() {
        let store = MemoryStore::new();
        let tx = store.begin("unused").await.unwrap();
        tx.commit(vec![
            StoreOp::ZsetAdd {
                key: "z".to_string(),
                member: "late".to_string(),
                score: 30,
            },
            StoreOp::ZsetAdd {
                key: "z".to_string(),
                member: "early".to_string(),
                score: 10,
            },
            StoreOp::ZsetAdd {
                key: "z".to_string(),
                member: "mid".to_string(),
                score: 20,
            },
        ])
        .await
        .unwrap();

        let due = store.zset_range_by_score("z", 25, 10).await.unwrap();
        assert_eq!(due, vec!["early".to_string(), "mid".to_string()]);

        let bounded = store.zset_range_by_score("z", 100, 1).await.unwrap();
        assert_eq!(bounded, vec!["early".to_string()]);
    }

    #[tokio::test]
    async fn deleting_every_field_reads_back_as_absent() {
        let store = MemoryStore::new();
        let tx = store.begin("job:a").await.unwrap();
        tx.commit(vec![hset("job:a", "state", "scheduled")])
            .await
            .unwrap();

        let tx = store.begin("job:a").await.unwrap();
        tx.commit(vec![StoreOp::HashDel {
            key: "job:a".to_string(),
            fields: vec!["state".to_string()],
        }])
        .await
        .unwrap();

        assert!(store.hash_get_all("job:a").await.unwrap().is_none());
    }
}
