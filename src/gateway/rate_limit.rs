use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike};

use super::limits::{Limit, ResolvedLimit, WindowKind};
use super::store::{CounterStore, WindowIncrement, WriteBatch};
use super::{GatewayError, Identity, Scope};

/// Local-clock bucket id for a window: minute, hour or day.
pub fn bucket_id(window: WindowKind, now: &DateTime<FixedOffset>) -> String {
    let format = match window {
        WindowKind::Rpm | WindowKind::Tpm => "%Y%m%d%H%M",
        WindowKind::Tph => "%Y%m%d%H",
        WindowKind::Tpd => "%Y%m%d",
    };
    now.format(format).to_string()
}

pub fn window_key(token_id: &str, window: WindowKind, now: &DateTime<FixedOffset>) -> String {
    format!("rl:token:{token_id}:{window}:{}", bucket_id(window, now))
}

/// Milliseconds until the current bucket rolls over; never zero.
pub fn retry_after_ms(window: WindowKind, now: &DateTime<FixedOffset>) -> u64 {
    let elapsed_secs = match window {
        WindowKind::Rpm | WindowKind::Tpm => u64::from(now.second()),
        WindowKind::Tph => u64::from(now.minute() * 60 + now.second()),
        WindowKind::Tpd => u64::from(now.num_seconds_from_midnight()),
    };
    let elapsed_ms = elapsed_secs * 1000 + u64::from(now.timestamp_subsec_millis().min(999));
    (window.window_seconds() * 1000)
        .saturating_sub(elapsed_ms)
        .max(1)
}

fn window_ttl(window: WindowKind) -> Duration {
    Duration::from_secs(window.window_seconds())
}

/// Fixed-window counters per token. The bucket id is part of the key, so a
/// window starts at its clock boundary; the TTL only bounds key lifetime.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Read-only half of admission: token windows are compared against usage
    /// already recorded. Nothing is written.
    pub async fn check_token_windows(
        &self,
        identity: &Identity,
        limits: &[ResolvedLimit],
        now: &DateTime<FixedOffset>,
    ) -> Result<(), GatewayError> {
        let token_limits: Vec<&ResolvedLimit> = limits
            .iter()
            .filter(|resolved| resolved.window != WindowKind::Rpm && !resolved.limit.is_unlimited())
            .collect();
        if token_limits.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = token_limits
            .iter()
            .map(|resolved| window_key(&identity.token_id, resolved.window, now))
            .collect();
        let used = self.store.get_many(&keys).await?;
        for (resolved, used) in token_limits.iter().zip(used) {
            if resolved.limit.is_exhausted_by(used) {
                return Err(self.denied(identity, resolved, used, now));
            }
        }
        Ok(())
    }

    /// Counts the request against the RPM window if it fits. This is the last
    /// admission step: only admitted requests occupy a slot.
    pub async fn count_request(
        &self,
        identity: &Identity,
        limits: &[ResolvedLimit],
        now: &DateTime<FixedOffset>,
    ) -> Result<(), GatewayError> {
        let Some(rpm) = limits
            .iter()
            .find(|resolved| resolved.window == WindowKind::Rpm)
        else {
            return Ok(());
        };
        let Limit::Bounded(limit) = rpm.limit else {
            return Ok(());
        };

        let key = window_key(&identity.token_id, WindowKind::Rpm, now);
        match self
            .store
            .increment_within(&key, 1, limit, window_ttl(WindowKind::Rpm))
            .await?
        {
            WindowIncrement::Admitted { .. } => Ok(()),
            WindowIncrement::Denied { count } => Err(self.denied(identity, rpm, count, now)),
        }
    }

    fn denied(
        &self,
        identity: &Identity,
        resolved: &ResolvedLimit,
        used: u64,
        now: &DateTime<FixedOffset>,
    ) -> GatewayError {
        let retry_after_ms = retry_after_ms(resolved.window, now);
        tracing::info!(
            token = %identity.token_id,
            window = %resolved.window,
            limit = %resolved.limit,
            source = ?resolved.source,
            used,
            retry_after_ms,
            "rate limit exceeded"
        );
        GatewayError::LimitExceeded {
            window: resolved.window,
            scope: Scope::token(&identity.token_id),
            retry_after_ms,
        }
    }

    /// Adds the tokens of a finished call to the current minute, hour and
    /// day buckets.
    pub fn token_writes(
        batch: &mut WriteBatch,
        identity: &Identity,
        total_tokens: u64,
        now: &DateTime<FixedOffset>,
    ) {
        if total_tokens == 0 {
            return;
        }
        for window in WindowKind::TOKEN_WINDOWS {
            batch.increment(
                window_key(&identity.token_id, window, now),
                total_tokens,
                window_ttl(window),
            );
        }
    }

    pub async fn record_tokens(
        &self,
        identity: &Identity,
        total_tokens: u64,
        now: &DateTime<FixedOffset>,
    ) -> Result<(), GatewayError> {
        let mut batch = WriteBatch::new();
        Self::token_writes(&mut batch, identity, total_tokens, now);
        self.store.apply(&batch).await?;
        Ok(())
    }
}
