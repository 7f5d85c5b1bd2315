use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::clock::{Clock, SystemClock};
use super::store::{CounterStore, StoreError, WindowIncrement, WriteBatch, WriteOp};

#[derive(Debug)]
enum Value {
    Counter(u64),
    Hash(HashMap<String, u64>),
    SortedSet(HashMap<String, i64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at_ms: Option<i64>,
}

// Bucketed keys are never read again once their window ends, so writes
// sweep the whole map at most once per clock second.
const SWEEP_INTERVAL_MS: i64 = 1_000;

/// Counter store for a single gateway process and for tests. Expiry is
/// evaluated against the injected clock on read and swept on write.
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    next_sweep_ms: AtomicI64,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            next_sweep_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Remaining lifetime of a key, if it exists and carries an expiry.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().await;
        let expires_at = entries.get(key)?.expires_at_ms?;
        (expires_at > now).then(|| Duration::from_millis((expires_at - now) as u64))
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: i64,
    ) -> Option<&'a mut Entry> {
        let expired = entries
            .get(key)
            .and_then(|entry| entry.expires_at_ms)
            .is_some_and(|at| at <= now);
        if expired {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    /// Called with the entries lock held.
    fn sweep_expired(&self, entries: &mut HashMap<String, Entry>, now: i64) {
        if now < self.next_sweep_ms.load(Ordering::Relaxed) {
            return;
        }
        entries.retain(|_, entry| entry.expires_at_ms.is_none_or(|at| at > now));
        self.next_sweep_ms
            .store(now.saturating_add(SWEEP_INTERVAL_MS), Ordering::Relaxed);
    }

    fn expiry(now: i64, ttl: Duration) -> Option<i64> {
        Some(now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Protocol(format!("key {key} holds a different value type"))
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<u64>, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        keys.iter()
            .map(|key| match Self::live(&mut entries, key, now) {
                None => Ok(0),
                Some(Entry {
                    value: Value::Counter(n),
                    ..
                }) => Ok(*n),
                Some(_) => Err(wrong_type(key)),
            })
            .collect()
    }

    async fn increment_within(
        &self,
        key: &str,
        amount: u64,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowIncrement, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        self.sweep_expired(&mut entries, now);
        let current = match Self::live(&mut entries, key, now) {
            None => 0,
            Some(Entry {
                value: Value::Counter(n),
                ..
            }) => *n,
            Some(_) => return Err(wrong_type(key)),
        };

        let next = current.saturating_add(amount);
        if next > limit {
            return Ok(WindowIncrement::Denied { count: current });
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Counter(next),
                expires_at_ms: Self::expiry(now, ttl),
            },
        );
        Ok(WindowIncrement::Admitted { count: next })
    }

    async fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        self.sweep_expired(&mut entries, now);

        // Type-check first so a failing batch leaves nothing half-written.
        for op in batch.ops() {
            let (key, ok) = match op {
                WriteOp::Increment { key, .. } => (
                    key,
                    matches!(
                        Self::live(&mut entries, key, now).map(|e| &e.value),
                        None | Some(Value::Counter(_))
                    ),
                ),
                WriteOp::HashIncrement { key, .. } => (
                    key,
                    matches!(
                        Self::live(&mut entries, key, now).map(|e| &e.value),
                        None | Some(Value::Hash(_))
                    ),
                ),
                WriteOp::SortedSetUpsert { key, .. } => (
                    key,
                    matches!(
                        Self::live(&mut entries, key, now).map(|e| &e.value),
                        None | Some(Value::SortedSet(_))
                    ),
                ),
            };
            if !ok {
                return Err(wrong_type(key));
            }
        }

        for op in batch.ops() {
            match op {
                WriteOp::Increment { key, amount, ttl } => {
                    let entry = entries.entry(key.clone()).or_insert(Entry {
                        value: Value::Counter(0),
                        expires_at_ms: None,
                    });
                    if let Value::Counter(n) = &mut entry.value {
                        *n = n.saturating_add(*amount);
                    }
                    entry.expires_at_ms = Self::expiry(now, *ttl);
                }
                WriteOp::HashIncrement { key, fields, ttl } => {
                    let entry = entries.entry(key.clone()).or_insert(Entry {
                        value: Value::Hash(HashMap::new()),
                        expires_at_ms: None,
                    });
                    if let Value::Hash(hash) = &mut entry.value {
                        for (field, amount) in fields {
                            let slot = hash.entry(field.clone()).or_insert(0);
                            *slot = slot.saturating_add(*amount);
                        }
                    }
                    entry.expires_at_ms = Self::expiry(now, *ttl);
                }
                WriteOp::SortedSetUpsert { key, member, score } => {
                    let entry = entries.entry(key.clone()).or_insert(Entry {
                        value: Value::SortedSet(HashMap::new()),
                        expires_at_ms: None,
                    });
                    if let Value::SortedSet(set) = &mut entry.value {
                        set.insert(member.clone(), *score);
                    }
                }
            }
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, u64>, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key, now) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn prune_and_count(&self, key: &str, min_score: i64) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key, now) {
            None => Ok(0),
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => {
                set.retain(|_, score| *score >= min_score);
                Ok(set.len() as u64)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }
}
