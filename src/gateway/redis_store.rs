use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use super::store::{CounterStore, StoreError, WindowIncrement, WriteBatch, WriteOp};

// Returns { admitted, count }; the write and its expiry happen only when admitted.
const INCREMENT_WITHIN_SCRIPT: &str = r#"
local amount = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local current = tonumber(redis.call("GET", KEYS[1]) or "0") or 0
if current + amount > limit then
  return { 0, current }
end

local next_count = redis.call("INCRBY", KEYS[1], amount)
if ttl > 0 then
  redis.call("EXPIRE", KEYS[1], ttl)
end
return { 1, next_count }
"#;

/// Counter store shared by every gateway instance through one Redis.
///
/// Keys are written without a prefix unless one is configured, so the
/// layout matches what the admin dashboard reads.
#[derive(Clone)]
pub struct RedisCounterStore {
    client: redis::Client,
    prefix: String,
    connection: std::sync::Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref()).map_err(unavailable)?,
            prefix: String::new(),
            connection: std::sync::Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.prefix)
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Maps a command error, dropping the cached connection if it is broken.
    fn command_error(&self, err: redis::RedisError) -> StoreError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            if let Ok(mut slot) = self.connection.try_lock() {
                *slot = None;
            }
        }
        unavailable(err)
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|err| self.command_error(err))?;
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let keys: Vec<String> = keys.iter().map(|key| self.key(key)).collect();
        let values: Vec<Option<u64>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|err| self.command_error(err))?;
        Ok(values.into_iter().map(|value| value.unwrap_or(0)).collect())
    }

    async fn increment_within(
        &self,
        key: &str,
        amount: u64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowIncrement, StoreError> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(INCREMENT_WITHIN_SCRIPT);
        let result: Vec<i64> = script
            .key(self.key(key))
            .arg(amount)
            .arg(limit)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| self.command_error(err))?;

        match result.as_slice() {
            [1, count] => Ok(WindowIncrement::Admitted {
                count: u64::try_from(*count).unwrap_or(0),
            }),
            [0, count] => Ok(WindowIncrement::Denied {
                count: u64::try_from(*count).unwrap_or(0),
            }),
            other => Err(StoreError::Protocol(format!(
                "increment script returned {other:?}"
            ))),
        }
    }

    async fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            match op {
                WriteOp::Increment { key, amount, ttl } => {
                    let key = self.key(key);
                    pipe.incr(&key, *amount).ignore();
                    pipe.expire(&key, ttl_secs(*ttl)).ignore();
                }
                WriteOp::HashIncrement { key, fields, ttl } => {
                    let key = self.key(key);
                    for (field, amount) in fields {
                        pipe.hincr(&key, field, *amount).ignore();
                    }
                    pipe.expire(&key, ttl_secs(*ttl)).ignore();
                }
                WriteOp::SortedSetUpsert { key, member, score } => {
                    pipe.zadd(self.key(key), member, *score).ignore();
                }
            }
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|err| self.command_error(err))?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, u64>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, u64> = redis::cmd("HGETALL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|err| self.command_error(err))?;
        Ok(raw)
    }

    async fn prune_and_count(&self, key: &str, min_score: i64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        let (_, count): (u64, u64) = redis::pipe()
            .atomic()
            .zrembyscore(&key, "-inf", format!("({min_score}"))
            .zcard(&key)
            .query_async(&mut conn)
            .await
            .map_err(|err| self.command_error(err))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests;
