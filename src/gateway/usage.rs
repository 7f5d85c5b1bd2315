use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

use super::store::{CounterStore, WriteBatch};
use super::{GatewayError, Identity};

pub const USAGE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const ACTIVE_USERS_KEY: &str = "active_users";
pub const ACTIVE_WINDOW_MS: i64 = 5 * 60 * 1000;

const REQUESTS: &str = "requests";
const INPUT_TOKENS: &str = "inputTokens";
const OUTPUT_TOKENS: &str = "outputTokens";

pub fn date_id(now: &DateTime<FixedOffset>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Validates a `YYYY-MM-DD` date coming from an admin query.
pub fn parse_date_id(raw: &str) -> Result<String, GatewayError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|date| date.format("%Y-%m-%d").to_string())
        .map_err(|_| GatewayError::InvalidRequest {
            reason: format!("expected a YYYY-MM-DD date, got {raw:?}"),
        })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageScope {
    Daily,
    User,
    Model,
    Token,
}

impl UsageScope {
    pub fn key(&self, id: &str, date: &str) -> String {
        match self {
            UsageScope::Daily => format!("daily_usage:{date}"),
            UsageScope::User => format!("user_usage:{id}:{date}"),
            UsageScope::Model => format!("model_usage:{id}:{date}"),
            UsageScope::Token => format!("token_usage:{id}:{date}"),
        }
    }
}

impl fmt::Display for UsageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UsageScope::Daily => "daily",
            UsageScope::User => "user",
            UsageScope::Model => "model",
            UsageScope::Token => "token",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageTotals {
    fn from_hash(hash: &HashMap<String, u64>) -> Self {
        let field = |name: &str| hash.get(name).copied().unwrap_or(0);
        Self {
            requests: field(REQUESTS),
            input_tokens: field(INPUT_TOKENS),
            output_tokens: field(OUTPUT_TOKENS),
        }
    }
}

/// Accounting owed by an admitted request. It is consumed by
/// [`PendingUsage::finish`], so one logical request yields at most one
/// [`UsageRecord`] however many endpoints it tried.
#[must_use = "admitted requests must be accounted for"]
#[derive(Debug)]
pub struct PendingUsage {
    identity: Identity,
    model_id: String,
}

impl PendingUsage {
    pub fn new(identity: Identity, model_id: impl Into<String>) -> Self {
        Self {
            identity,
            model_id: model_id.into(),
        }
    }

    pub fn finish(self, input_tokens: u64, output_tokens: u64) -> UsageRecord {
        UsageRecord {
            identity: self.identity,
            model_id: self.model_id,
            input_tokens,
            output_tokens,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageRecord {
    pub identity: Identity,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Writes and reads the per-day aggregates and the active-user set.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn CounterStore>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub fn usage_writes(batch: &mut WriteBatch, record: &UsageRecord, now: &DateTime<FixedOffset>) {
        let date = date_id(now);
        let fields = || {
            vec![
                (REQUESTS.to_string(), 1),
                (INPUT_TOKENS.to_string(), record.input_tokens),
                (OUTPUT_TOKENS.to_string(), record.output_tokens),
            ]
        };
        batch
            .hash_increment(UsageScope::Daily.key("", &date), fields(), USAGE_TTL)
            .hash_increment(
                UsageScope::User.key(&record.identity.user_id, &date),
                fields(),
                USAGE_TTL,
            )
            .hash_increment(
                UsageScope::Model.key(&record.model_id, &date),
                fields(),
                USAGE_TTL,
            );
        if !record.identity.token_id.is_empty() {
            batch.hash_increment(
                UsageScope::Token.key(&record.identity.token_id, &date),
                fields(),
                USAGE_TTL,
            );
        }
        batch.sorted_set_upsert(
            ACTIVE_USERS_KEY,
            record.identity.user_id.clone(),
            now.timestamp_millis(),
        );
    }

    pub async fn record(
        &self,
        record: &UsageRecord,
        now: &DateTime<FixedOffset>,
    ) -> Result<(), GatewayError> {
        let mut batch = WriteBatch::new();
        Self::usage_writes(&mut batch, record, now);
        self.store.apply(&batch).await?;
        Ok(())
    }

    pub async fn totals(
        &self,
        scope: UsageScope,
        id: &str,
        date: &str,
    ) -> Result<UsageTotals, GatewayError> {
        let hash = self.store.hash_get_all(&scope.key(id, date)).await?;
        Ok(UsageTotals::from_hash(&hash))
    }

    pub async fn daily(&self, date: &str) -> Result<UsageTotals, GatewayError> {
        self.totals(UsageScope::Daily, "", date).await
    }

    /// Distinct users seen in the last five minutes.
    pub async fn active_users(&self, now_ms: i64) -> Result<u64, GatewayError> {
        let count = self
            .store
            .prune_and_count(ACTIVE_USERS_KEY, now_ms.saturating_sub(ACTIVE_WINDOW_MS))
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::clock::{Clock, ManualClock};
    use crate::gateway::memory_store::MemoryCounterStore;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2025, 3, 14, 10, 0, 0)
                .unwrap(),
        ))
    }

    fn pending(user: &str) -> PendingUsage {
        PendingUsage::new(
            Identity {
                token_id: format!("tok-{user}"),
                user_id: user.to_string(),
                department_id: None,
            },
            "gpt-4o",
        )
    }

    #[tokio::test]
    async fn one_record_updates_every_aggregate_once() {
        let clock = clock();
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let recorder = UsageRecorder::new(store.clone());
        let now = clock.now();

        let record = pending("alice").finish(12, 30);
        recorder.record(&record, &now).await.unwrap();

        let expected = UsageTotals {
            requests: 1,
            input_tokens: 12,
            output_tokens: 30,
        };
        assert_eq!(recorder.daily("2025-03-14").await.unwrap(), expected);
        for (scope, id) in [
            (UsageScope::User, "alice"),
            (UsageScope::Model, "gpt-4o"),
            (UsageScope::Token, "tok-alice"),
        ] {
            assert_eq!(
                recorder.totals(scope, id, "2025-03-14").await.unwrap(),
                expected
            );
        }
        assert_eq!(
            store.ttl("daily_usage:2025-03-14").await,
            Some(USAGE_TTL)
        );
    }

    #[tokio::test]
    async fn active_users_counts_distinct_users_in_the_last_five_minutes() {
        let clock = clock();
        let recorder = UsageRecorder::new(Arc::new(MemoryCounterStore::with_clock(clock.clone())));

        recorder
            .record(&pending("alice").finish(1, 1), &clock.now())
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(3));
        recorder
            .record(&pending("bob").finish(1, 1), &clock.now())
            .await
            .unwrap();
        recorder
            .record(&pending("bob").finish(1, 1), &clock.now())
            .await
            .unwrap();
        assert_eq!(recorder.active_users(clock.now_millis()).await.unwrap(), 2);

        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(recorder.active_users(clock.now_millis()).await.unwrap(), 2);

        clock.advance(chrono::Duration::milliseconds(1));
        assert_eq!(recorder.active_users(clock.now_millis()).await.unwrap(), 1);
    }

    #[test]
    fn admin_dates_are_validated() {
        assert_eq!(parse_date_id("2025-03-14").unwrap(), "2025-03-14");
        assert!(parse_date_id("2025-3-14x").is_err());
        assert!(parse_date_id("../etc").is_err());
    }
}
