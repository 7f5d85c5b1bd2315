use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset};

use super::config::ConfigSnapshot;
use super::limits::Limit;
use super::store::{CounterStore, WriteBatch};
use super::{GatewayError, Identity, Scope};

/// Keys outlive their month so late writes around the boundary still land.
pub const BUDGET_TTL: Duration = Duration::from_secs(62 * 24 * 60 * 60);

/// `YYYY-M`, month without zero padding.
pub fn month_id(now: &DateTime<FixedOffset>) -> String {
    format!("{}-{}", now.year(), now.month())
}

pub fn budget_key(scope: &Scope, now: &DateTime<FixedOffset>) -> String {
    format!("budget:monthly:{}:{}:{}", scope.kind, scope.id, month_id(now))
}

/// Every scope an identity's spend counts against, with its ceiling.
pub fn scope_limits(config: &ConfigSnapshot, identity: &Identity) -> Vec<(Scope, Limit)> {
    let sentinel = config.config().budget.unlimited_sentinel;
    let mut out = Vec::with_capacity(3);
    out.push((
        Scope::user(&identity.user_id),
        Limit::from_budget(
            config
                .user(&identity.user_id)
                .and_then(|user| user.monthly_output_tokens),
            sentinel,
        ),
    ));
    out.push((
        Scope::token(&identity.token_id),
        Limit::from_budget(
            config
                .token(&identity.token_id)
                .and_then(|token| token.monthly_output_tokens),
            sentinel,
        ),
    ));
    if let Some(department_id) = identity.department_id.as_deref() {
        out.push((
            Scope::department(department_id),
            Limit::from_budget(
                config
                    .department(department_id)
                    .and_then(|department| department.monthly_output_tokens),
                sentinel,
            ),
        ));
    }
    out
}

/// Monthly output-token ledger. A request must fit every bounded scope.
#[derive(Clone)]
pub struct BudgetLedger {
    store: Arc<dyn CounterStore>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub async fn check(
        &self,
        config: &ConfigSnapshot,
        identity: &Identity,
        now: &DateTime<FixedOffset>,
    ) -> Result<(), GatewayError> {
        let bounded: Vec<(Scope, u64)> = scope_limits(config, identity)
            .into_iter()
            .filter_map(|(scope, limit)| match limit {
                Limit::Bounded(n) => Some((scope, n)),
                Limit::Unlimited => None,
            })
            .collect();
        if bounded.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = bounded
            .iter()
            .map(|(scope, _)| budget_key(scope, now))
            .collect();
        let used = self.store.get_many(&keys).await?;
        for ((scope, limit), used) in bounded.into_iter().zip(used) {
            if Limit::Bounded(limit).is_exhausted_by(used) {
                tracing::info!(scope = %scope, used, limit, "monthly budget exceeded");
                return Err(GatewayError::BudgetExceeded { scope, used, limit });
            }
        }
        Ok(())
    }

    pub fn budget_writes(
        batch: &mut WriteBatch,
        identity: &Identity,
        output_tokens: u64,
        now: &DateTime<FixedOffset>,
    ) {
        if output_tokens == 0 {
            return;
        }
        let mut scopes = vec![Scope::user(&identity.user_id), Scope::token(&identity.token_id)];
        if let Some(department_id) = identity.department_id.as_deref() {
            scopes.push(Scope::department(department_id));
        }
        for scope in scopes {
            batch.increment(budget_key(&scope, now), output_tokens, BUDGET_TTL);
        }
    }

    pub async fn record(
        &self,
        identity: &Identity,
        output_tokens: u64,
        now: &DateTime<FixedOffset>,
    ) -> Result<(), GatewayError> {
        let mut batch = WriteBatch::new();
        Self::budget_writes(&mut batch, identity, output_tokens, now);
        self.store.apply(&batch).await?;
        Ok(())
    }

    pub async fn used(
        &self,
        scope: &Scope,
        now: &DateTime<FixedOffset>,
    ) -> Result<u64, GatewayError> {
        let used = self.store.get_many(&[budget_key(scope, now)]).await?;
        Ok(used.into_iter().next().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::clock::ManualClock;
    use crate::gateway::config::{DepartmentConfig, GatewayConfig, TokenConfig, UserConfig};
    use crate::gateway::memory_store::MemoryCounterStore;
    use chrono::TimeZone;

    fn at(month: u32, day: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2025, month, day, 12, 0, 0)
            .unwrap()
    }

    fn snapshot(user_budget: Option<u64>, department_budget: Option<u64>) -> ConfigSnapshot {
        let mut config = GatewayConfig::default();
        config.departments.push(DepartmentConfig {
            id: "eng".to_string(),
            rate_limit_enabled: false,
            rate_limits: Default::default(),
            monthly_output_tokens: department_budget,
        });
        config.users.push(UserConfig {
            id: "alice".to_string(),
            department_id: Some("eng".to_string()),
            monthly_output_tokens: user_budget,
        });
        config.tokens.push(TokenConfig::new("tok-1", "sk-1", "alice"));
        ConfigSnapshot::new(config).expect("snapshot")
    }

    fn ledger(now: DateTime<FixedOffset>) -> BudgetLedger {
        let clock = Arc::new(ManualClock::new(now));
        BudgetLedger::new(Arc::new(MemoryCounterStore::with_clock(clock)))
    }

    #[test]
    fn month_key_is_not_zero_padded() {
        assert_eq!(
            budget_key(&Scope::user("alice"), &at(3, 1)),
            "budget:monthly:user:alice:2025-3"
        );
    }

    #[tokio::test]
    async fn counter_is_the_sum_of_recorded_output() {
        let now = at(3, 10);
        let ledger = ledger(now);
        let identity = snapshot(None, None).identity_for_token("tok-1").unwrap();
        for tokens in [10, 25, 7] {
            ledger.record(&identity, tokens, &now).await.unwrap();
        }
        assert_eq!(ledger.used(&Scope::user("alice"), &now).await.unwrap(), 42);
        assert_eq!(ledger.used(&Scope::token("tok-1"), &now).await.unwrap(), 42);
        assert_eq!(ledger.used(&Scope::department("eng"), &now).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn exhausted_user_budget_denies_until_month_rolls_over() {
        let now = at(3, 31);
        let ledger = ledger(now);
        let snapshot = snapshot(Some(100), None);
        let identity = snapshot.identity_for_token("tok-1").unwrap();

        ledger.record(&identity, 99, &now).await.unwrap();
        ledger.check(&snapshot, &identity, &now).await.expect("under budget");

        ledger.record(&identity, 1, &now).await.unwrap();
        let err = ledger
            .check(&snapshot, &identity, &now)
            .await
            .expect_err("at budget");
        match err {
            GatewayError::BudgetExceeded { scope, used, limit } => {
                assert_eq!(scope, Scope::user("alice"));
                assert_eq!((used, limit), (100, 100));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        ledger
            .check(&snapshot, &identity, &at(4, 1))
            .await
            .expect("new month");
    }

    #[tokio::test]
    async fn sentinel_department_budget_never_denies() {
        let now = at(3, 10);
        let ledger = ledger(now);
        let snapshot = snapshot(None, Some(999_999_999));
        let identity = snapshot.identity_for_token("tok-1").unwrap();

        ledger.record(&identity, 5_000_000_000, &now).await.unwrap();
        ledger
            .check(&snapshot, &identity, &now)
            .await
            .expect("unlimited department");
    }

    #[tokio::test]
    async fn department_ceiling_applies_alongside_user() {
        let now = at(3, 10);
        let ledger = ledger(now);
        let snapshot = snapshot(Some(1_000), Some(50));
        let identity = snapshot.identity_for_token("tok-1").unwrap();

        ledger.record(&identity, 60, &now).await.unwrap();
        let err = ledger.check(&snapshot, &identity, &now).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::BudgetExceeded { ref scope, .. } if *scope == Scope::department("eng")
        ));
    }
}
