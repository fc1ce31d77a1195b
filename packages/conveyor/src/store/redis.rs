//! Redis-backed store.
//!
//! Plain reads and index scans go through a shared [`ConnectionManager`].
//! Transactions need `WATCH` state, which must not interleave with other
//! callers, so each one opens a dedicated connection for its lifetime and
//! commits with a single `MULTI`/`EXEC` pipeline. A nil `EXEC` reply is a
//! watch conflict. No Lua scripting is used.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client, RedisError};

use crate::error::StoreError;
use crate::store::{CommitOutcome, Store, StoreOp, StoreTx};

impl From<RedisError> for StoreError {
    fn from(error: RedisError) -> Self {
        StoreError::Unavailable(error.to_string())
    }
}

/// Store implementation over a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to the server at `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }
}

/// Open `WATCH` transaction over a dedicated connection.
pub struct RedisTx {
    conn: MultiplexedConnection,
}

#[async_trait]
impl StoreTx for RedisTx {
    async fn hash_get_all(
        &mut self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError> {
        let raw: HashMap<String, String> = self.conn.hgetall(key).await?;
        Ok(if raw.is_empty() { None } else { Some(raw) })
    }

    async fn commit(mut self, ops: Vec<StoreOp>) -> Result<CommitOutcome, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                StoreOp::HashSet { key, fields } => {
                    pipe.hset_multiple(key, fields).ignore();
                }
                StoreOp::HashDel { key, fields } => {
                    pipe.hdel(key, fields.clone()).ignore();
                }
                StoreOp::ZsetAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                StoreOp::ZsetRem { key, member } => {
                    pipe.zrem(key, member).ignore();
                }
                StoreOp::SetAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                StoreOp::SetRem { key, member } => {
                    pipe.srem(key, member).ignore();
                }
            }
        }
        // A nil EXEC reply means the watched key changed under us.
        let reply: Option<()> = pipe.query_async(&mut self.conn).await?;
        Ok(match reply {
            Some(()) => CommitOutcome::Committed,
            None => CommitOutcome::Conflict,
        })
    }

    async fn abort(mut self) -> Result<(), StoreError> {
        let _: () = redis::cmd("UNWATCH").query_async(&mut self.conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    type Tx = RedisTx;

    async fn begin(&self, watch_key: &str) -> Result<RedisTx, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("WATCH")
            .arg(watch_key)
            .query_async(&mut conn)
            .await?;
        Ok(RedisTx { conn })
    }

    async fn hash_get_all(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(if raw.is_empty() { None } else { Some(raw) })
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(key, "-inf", max_score, 0, limit as isize)
            .await?;
        Ok(members)
    }

    async fn set_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let member: Option<String> = conn.spop(key).await?;
        Ok(member)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }
}
