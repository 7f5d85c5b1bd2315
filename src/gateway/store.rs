use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected counter store response: {0}")]
    Protocol(String),
}

/// Result of a check-then-increment on a window counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowIncrement {
    /// The increment was applied; `count` is the post-increment value.
    Admitted { count: u64 },
    /// The increment would exceed the limit and was not applied.
    Denied { count: u64 },
}

/// One mutation inside an atomic [`WriteBatch`]. Every op refreshes the
/// key's expiry after writing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Increment {
        key: String,
        amount: u64,
        ttl: Duration,
    },
    HashIncrement {
        key: String,
        fields: Vec<(String, u64)>,
        ttl: Duration,
    },
    SortedSetUpsert {
        key: String,
        member: String,
        score: i64,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, key: impl Into<String>, amount: u64, ttl: Duration) -> &mut Self {
        self.ops.push(WriteOp::Increment {
            key: key.into(),
            amount,
            ttl,
        });
        self
    }

    pub fn hash_increment(
        &mut self,
        key: impl Into<String>,
        fields: Vec<(String, u64)>,
        ttl: Duration,
    ) -> &mut Self {
        self.ops.push(WriteOp::HashIncrement {
            key: key.into(),
            fields,
            ttl,
        });
        self
    }

    pub fn sorted_set_upsert(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        score: i64,
    ) -> &mut Self {
        self.ops.push(WriteOp::SortedSetUpsert {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Shared atomic counter store. All gateway instances that must agree on
/// admission point at the same store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Reads integer counters; missing or expired keys read as zero.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<u64>, StoreError>;

    /// Adds `amount` only if the result stays within `limit`, as one atomic step.
    async fn increment_within(
        &self,
        key: &str,
        amount: u64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowIncrement, StoreError>;

    /// Applies every op or none of them.
    async fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, u64>, StoreError>;

    /// Removes members scored below `min_score`, then returns the remaining cardinality.
    async fn prune_and_count(&self, key: &str, min_score: i64) -> Result<u64, StoreError>;
}
