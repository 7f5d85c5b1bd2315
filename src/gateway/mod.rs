//! Admission, quota and routing for the completion request path.

pub mod budget;
pub mod clock;
pub mod config;
pub mod health;
pub mod limits;
pub mod logging;
pub mod memory_store;
pub mod observability;
pub mod rate_limit;
#[cfg(feature = "gateway-store-redis")]
pub mod redis_store;
pub mod router;
pub mod store;
pub mod sweeper;
pub mod upstream;
pub mod usage;

pub mod http;
#[cfg(feature = "gateway-otel")]
pub mod otel;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use budget::BudgetLedger;
use clock::{Clock, SystemClock};
use config::{CachedConfig, ConfigSnapshot};
use health::{EndpointHealthSnapshot, HealthRegistry};
use limits::{LimitResolver, ResolvedLimit, WindowKind};
use observability::{Observability, ObservabilitySnapshot};
use rate_limit::RateLimiter;
use router::{EndpointMember, EndpointPool, EndpointSelector};
use store::{CounterStore, StoreError, WriteBatch};
use upstream::{TokenUsage, Upstream, UpstreamFailure, UpstreamReply};
use usage::{PendingUsage, UsageRecord, UsageRecorder, UsageScope, UsageTotals};

pub use config::{GatewayConfig, TokenConfig};
pub use limits::{Limit, RateLimitConfig};

/// Who a request is accounted to. Always carries a token; the user and
/// department come from the token's owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub token_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Token,
    User,
    Department,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScopeKind::Token => "token",
            ScopeKind::User => "user",
            ScopeKind::Department => "department",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub kind: ScopeKind,
    pub id: String,
}

impl Scope {
    pub fn token(id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Token,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::User,
            id: id.into(),
        }
    }

    pub fn department(id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Department,
            id: id.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Caller's token secret.
    pub token: String,
    pub model: String,
    /// OpenAI-compatible chat completion body, forwarded as-is.
    pub payload: Value,
}

impl fmt::Debug for GatewayRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRequest")
            .field("token", &"<redacted>")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub body: Value,
    pub endpoint_id: String,
    pub attempts: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized token")]
    Unauthorized,
    #[error("unknown model: {model}")]
    UnknownModel { model: String },
    #[error("unknown endpoint: {endpoint_id}")]
    UnknownEndpoint { endpoint_id: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("{window} limit exceeded for {scope}; retry after {retry_after_ms}ms")]
    LimitExceeded {
        window: WindowKind,
        scope: Scope,
        retry_after_ms: u64,
    },
    #[error("monthly budget exceeded for {scope}: used={used} limit={limit}")]
    BudgetExceeded { scope: Scope, used: u64, limit: u64 },
    #[error("no healthy endpoint for model {model_id}")]
    NoHealthyEndpoint { model_id: String },
    #[error("upstream timed out")]
    UpstreamTimeout,
    #[error("upstream error ({status_code}): {body}")]
    UpstreamError { status_code: u16, body: String },
    #[error("counter store unavailable: {message}")]
    CounterStoreUnavailable { message: String },
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::CounterStoreUnavailable {
            message: err.to_string(),
        }
    }
}

impl From<UpstreamFailure> for GatewayError {
    fn from(failure: UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::Timeout => GatewayError::UpstreamTimeout,
            UpstreamFailure::Transport(message) => GatewayError::UpstreamError {
                status_code: 502,
                body: message,
            },
            UpstreamFailure::Status { code, body } => GatewayError::UpstreamError {
                status_code: code,
                body,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    RateLimited,
    BudgetExceeded,
    NoHealthyEndpoint,
}

/// Structured body for a denied request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

impl GatewayError {
    /// The structured rejection for admission and routing denials.
    pub fn rejection(&self) -> Option<Rejection> {
        let message = self.to_string();
        match self {
            GatewayError::LimitExceeded {
                window,
                scope,
                retry_after_ms,
            } => Some(Rejection {
                reason: RejectionReason::RateLimited,
                message,
                retry_after_ms: Some(*retry_after_ms),
                window: Some(*window),
                scope: Some(scope.clone()),
            }),
            GatewayError::BudgetExceeded { scope, .. } => Some(Rejection {
                reason: RejectionReason::BudgetExceeded,
                message,
                retry_after_ms: None,
                window: None,
                scope: Some(scope.clone()),
            }),
            GatewayError::NoHealthyEndpoint { .. } => Some(Rejection {
                reason: RejectionReason::NoHealthyEndpoint,
                message,
                retry_after_ms: None,
                window: None,
                scope: None,
            }),
            _ => None,
        }
    }
}

/// Health of one configured endpoint, for the system-health view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub model_id: String,
    pub url: String,
    pub enabled: bool,
    pub sort_order: i32,
    #[serde(flatten)]
    pub health: EndpointHealthSnapshot,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckAllOutcome {
    Completed { endpoints: Vec<EndpointStatus> },
    /// Another bulk check is still running.
    AlreadyRunning,
}

struct Forwarded {
    reply: UpstreamReply,
    endpoint_id: String,
    attempts: usize,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Gateway {
    config: Arc<CachedConfig>,
    store: Arc<dyn CounterStore>,
    upstream: Arc<dyn Upstream>,
    clock: Arc<dyn Clock>,
    rate_limiter: RateLimiter,
    budget: BudgetLedger,
    usage: UsageRecorder,
    health: HealthRegistry,
    selector: EndpointSelector,
    observability: Observability,
    check_all_in_flight: AtomicBool,
}

impl Gateway {
    pub fn new(
        config: Arc<CachedConfig>,
        store: Arc<dyn CounterStore>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self::with_clock(config, store, upstream, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: Arc<CachedConfig>,
        store: Arc<dyn CounterStore>,
        upstream: Arc<dyn Upstream>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            rate_limiter: RateLimiter::new(store.clone()),
            budget: BudgetLedger::new(store.clone()),
            usage: UsageRecorder::new(store.clone()),
            store,
            upstream,
            clock,
            health: HealthRegistry::new(),
            selector: EndpointSelector,
            observability: Observability::default(),
            check_all_in_flight: AtomicBool::new(false),
        }
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn ping_store(&self) -> Result<(), GatewayError> {
        self.store.ping().await?;
        Ok(())
    }

    pub async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let started = Instant::now();
        self.observability.record_request();
        let result = self.handle_inner(request).await;
        match &result {
            Ok(_) => self.observability.record_latency(started.elapsed()),
            Err(err) => self.observability.record_error(err),
        }
        result
    }

    async fn handle_inner(
        &self,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        validate_payload(&request.payload)?;

        let snapshot = self.config.snapshot().await;
        let identity = snapshot
            .identity_for_secret(&request.token)
            .ok_or(GatewayError::Unauthorized)?;
        let pool = snapshot
            .pool(&request.model)
            .ok_or_else(|| GatewayError::UnknownModel {
                model: request.model.clone(),
            })?;

        let now = self.clock.now();
        let limits = LimitResolver::new(&snapshot).resolve_all(&identity);
        self.admit(&snapshot, &identity, &limits, &now).await?;
        self.observability.record_admitted();
        tracing::debug!(
            token = %identity.token_id,
            user = %identity.user_id,
            model = %request.model,
            "request admitted"
        );

        let pending = PendingUsage::new(identity, request.model.clone());
        match self.forward(&snapshot, pool, &request.payload).await {
            Ok(forwarded) => {
                let TokenUsage {
                    input_tokens,
                    output_tokens,
                } = forwarded.reply.usage;
                self.account(pending.finish(input_tokens, output_tokens))
                    .await;
                Ok(GatewayResponse {
                    body: forwarded.reply.body,
                    endpoint_id: forwarded.endpoint_id,
                    attempts: forwarded.attempts,
                    input_tokens,
                    output_tokens,
                })
            }
            // The upstream answered, so the request happened even though it failed.
            Err(err @ GatewayError::UpstreamError { .. }) => {
                self.account(pending.finish(0, 0)).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Token windows and budgets are read-only checks; the RPM slot is taken
    /// last so a denied request never occupies one.
    async fn admit(
        &self,
        snapshot: &ConfigSnapshot,
        identity: &Identity,
        limits: &[ResolvedLimit],
        now: &DateTime<FixedOffset>,
    ) -> Result<(), GatewayError> {
        let fail_open = snapshot.config().admission.fail_open;
        let windows = self
            .rate_limiter
            .check_token_windows(identity, limits, now)
            .await;
        self.store_outage(windows, fail_open, identity, "rate_limit")?;
        let budget = self.budget.check(snapshot, identity, now).await;
        self.store_outage(budget, fail_open, identity, "budget")?;
        let slot = self.rate_limiter.count_request(identity, limits, now).await;
        self.store_outage(slot, fail_open, identity, "rate_limit")
    }

    fn store_outage(
        &self,
        result: Result<(), GatewayError>,
        fail_open: bool,
        identity: &Identity,
        stage: &'static str,
    ) -> Result<(), GatewayError> {
        match result {
            Err(GatewayError::CounterStoreUnavailable { message }) if fail_open => {
                self.observability.record_store_error();
                tracing::error!(
                    token = %identity.token_id,
                    stage,
                    error = %message,
                    "counter store unavailable; admitting unmetered request"
                );
                Ok(())
            }
            Err(GatewayError::CounterStoreUnavailable { message }) => {
                tracing::error!(
                    token = %identity.token_id,
                    stage,
                    error = %message,
                    "counter store unavailable; rejecting request"
                );
                Err(GatewayError::CounterStoreUnavailable { message })
            }
            other => other,
        }
    }

    async fn forward(
        &self,
        snapshot: &ConfigSnapshot,
        pool: &EndpointPool,
        payload: &Value,
    ) -> Result<Forwarded, GatewayError> {
        let settings = &snapshot.config().upstream;
        let breaker = &snapshot.config().circuit_breaker;
        let timeout = Duration::from_secs(settings.request_timeout_seconds);
        let max_attempts = settings.max_attempts.unwrap_or(usize::MAX);

        let candidates: Vec<EndpointMember> = self
            .selector
            .candidates(pool, &self.health, self.clock.now_millis())
            .into_iter()
            .cloned()
            .collect();

        let mut attempts = 0;
        let mut capped = false;
        let mut last_failure: Option<UpstreamFailure> = None;
        for (index, endpoint) in candidates.iter().enumerate() {
            if attempts >= max_attempts {
                let now_ms = self.clock.now_millis();
                capped = candidates[index..]
                    .iter()
                    .any(|rest| self.health.is_eligible(&rest.endpoint_id, now_ms));
                break;
            }
            // Another request may have tripped this endpoint since ranking,
            // or holds its half-open trial.
            if !self
                .health
                .try_begin_attempt(&endpoint.endpoint_id, self.clock.now_millis())
            {
                continue;
            }
            if attempts > 0 {
                self.observability.record_failover();
                tracing::info!(
                    model = %pool.model_id,
                    endpoint = %endpoint.endpoint_id,
                    attempt = attempts + 1,
                    "failing over to next endpoint"
                );
            }
            attempts += 1;

            let result = match tokio::time::timeout(
                timeout,
                self.upstream.complete(endpoint, payload, timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(UpstreamFailure::Timeout),
            };

            match result {
                Ok(reply) => {
                    self.health
                        .record_success(&endpoint.endpoint_id, self.clock.now_millis());
                    return Ok(Forwarded {
                        reply,
                        endpoint_id: endpoint.endpoint_id.clone(),
                        attempts,
                    });
                }
                Err(failure) => {
                    tracing::warn!(
                        model = %pool.model_id,
                        endpoint = %endpoint.endpoint_id,
                        error = %failure,
                        "upstream attempt failed"
                    );
                    if failure.counts_against_endpoint() {
                        self.health.record_failure(
                            &endpoint.endpoint_id,
                            self.clock.now_millis(),
                            breaker,
                            failure.to_string(),
                        );
                    } else {
                        self.health.release_trial(&endpoint.endpoint_id);
                    }
                    if !failure.is_retryable() {
                        return Err(failure.into());
                    }
                    last_failure = Some(failure);
                }
            }
        }

        // Hitting the attempt cap with eligible endpoints left surfaces the
        // last failure; running out of endpoints does not.
        match last_failure {
            Some(failure) if capped => Err(failure.into()),
            _ => Err(GatewayError::NoHealthyEndpoint {
                model_id: pool.model_id.clone(),
            }),
        }
    }

    /// Token counters, monthly budgets and usage aggregates in one batch.
    async fn account(&self, record: UsageRecord) {
        let now = self.clock.now();
        let mut batch = WriteBatch::new();
        RateLimiter::token_writes(&mut batch, &record.identity, record.total_tokens(), &now);
        BudgetLedger::budget_writes(&mut batch, &record.identity, record.output_tokens, &now);
        UsageRecorder::usage_writes(&mut batch, &record, &now);

        if let Err(err) = self.store.apply(&batch).await {
            self.observability.record_store_error();
            tracing::warn!(
                token = %record.identity.token_id,
                model = %record.model_id,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                error = %err,
                "failed to record usage"
            );
        }
    }

    fn endpoint_status(
        &self,
        pool: &EndpointPool,
        member: &EndpointMember,
        now_ms: i64,
    ) -> EndpointStatus {
        EndpointStatus {
            model_id: pool.model_id.clone(),
            url: member.url.clone(),
            enabled: member.enabled,
            sort_order: member.sort_order,
            health: self.health.snapshot(&member.endpoint_id, now_ms),
        }
    }

    /// Every configured endpoint, grouped by model in rank order.
    pub async fn endpoint_health(&self) -> Vec<EndpointStatus> {
        let snapshot = self.config.snapshot().await;
        let now_ms = self.clock.now_millis();
        let mut pools: Vec<&EndpointPool> = snapshot.pools().collect();
        pools.sort_by(|a, b| a.model_id.cmp(&b.model_id));

        let mut out = Vec::new();
        for pool in pools {
            let mut members: Vec<&EndpointMember> = pool.members().iter().collect();
            members.sort_by_key(|member| member.sort_order);
            out.extend(
                members
                    .into_iter()
                    .map(|member| self.endpoint_status(pool, member, now_ms)),
            );
        }
        out
    }

    async fn probe(
        &self,
        snapshot: &ConfigSnapshot,
        pool: &EndpointPool,
        member: &EndpointMember,
    ) -> EndpointStatus {
        let timeout = Duration::from_secs(snapshot.config().upstream.probe_timeout_seconds);
        let result = match tokio::time::timeout(timeout, self.upstream.probe(member, timeout)).await
        {
            Ok(result) => result,
            Err(_) => Err(UpstreamFailure::Timeout),
        };
        let now_ms = self.clock.now_millis();
        match result {
            Ok(()) => {
                self.health.record_success(&member.endpoint_id, now_ms);
            }
            Err(failure) => {
                tracing::warn!(
                    endpoint = %member.endpoint_id,
                    error = %failure,
                    "endpoint probe failed"
                );
                self.health.record_probe_failure(
                    &member.endpoint_id,
                    now_ms,
                    &snapshot.config().circuit_breaker,
                    failure.to_string(),
                );
            }
        }
        self.endpoint_status(pool, member, now_ms)
    }

    /// Synchronous out-of-band probe. Success restores the endpoint at once.
    pub async fn check_endpoint(&self, endpoint_id: &str) -> Result<EndpointStatus, GatewayError> {
        let snapshot = self.config.snapshot().await;
        let (pool, member) = snapshot
            .pools()
            .find_map(|pool| pool.member(endpoint_id).map(|member| (pool, member)))
            .ok_or_else(|| GatewayError::UnknownEndpoint {
                endpoint_id: endpoint_id.to_string(),
            })?;
        Ok(self.probe(&snapshot, pool, member).await)
    }

    /// Probes every enabled endpoint concurrently. At most one bulk check
    /// runs at a time across the admin route and the sweeper.
    pub async fn check_all_endpoints(&self) -> CheckAllOutcome {
        if self
            .check_all_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("endpoint check already running");
            return CheckAllOutcome::AlreadyRunning;
        }
        let _guard = InFlight(&self.check_all_in_flight);

        let snapshot = self.config.snapshot().await;
        self.health.retain(
            snapshot
                .pools()
                .flat_map(|pool| pool.members().iter().map(|m| m.endpoint_id.as_str())),
        );

        let probes = snapshot.pools().flat_map(|pool| {
            pool.members()
                .iter()
                .filter(|member| member.enabled)
                .map(move |member| (pool, member))
        });
        let snapshot_ref = &snapshot;
        let mut endpoints = futures_util::future::join_all(
            probes.map(|(pool, member)| self.probe(snapshot_ref, pool, member)),
        )
        .await;
        endpoints.sort_by(|a, b| {
            (a.model_id.as_str(), a.sort_order).cmp(&(b.model_id.as_str(), b.sort_order))
        });
        tracing::info!(endpoints = endpoints.len(), "endpoint check finished");
        CheckAllOutcome::Completed { endpoints }
    }

    pub fn check_all_in_flight(&self) -> bool {
        self.check_all_in_flight.load(Ordering::Acquire)
    }

    pub async fn active_users(&self) -> Result<u64, GatewayError> {
        self.usage.active_users(self.clock.now_millis()).await
    }

    pub async fn usage_totals(
        &self,
        scope: UsageScope,
        id: &str,
        date: &str,
    ) -> Result<UsageTotals, GatewayError> {
        let date = usage::parse_date_id(date)?;
        self.usage.totals(scope, id, &date).await
    }
}

fn validate_payload(payload: &Value) -> Result<(), GatewayError> {
    let Some(obj) = payload.as_object() else {
        return Err(GatewayError::InvalidRequest {
            reason: "request body must be a JSON object".to_string(),
        });
    };
    if obj.get("stream").and_then(Value::as_bool) == Some(true) {
        return Err(GatewayError::InvalidRequest {
            reason: "streaming responses are not supported".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_carries_reason_and_retry_after() {
        let err = GatewayError::LimitExceeded {
            window: WindowKind::Rpm,
            scope: Scope::token("tok-1"),
            retry_after_ms: 1_500,
        };
        let rejection = err.rejection().expect("rejection");
        assert_eq!(rejection.reason, RejectionReason::RateLimited);
        assert_eq!(rejection.retry_after_ms, Some(1_500));
        assert_eq!(rejection.window, Some(WindowKind::Rpm));

        let json = serde_json::to_value(&rejection).expect("json");
        assert_eq!(json["reason"], "rate_limited");
        assert_eq!(json["scope"]["kind"], "token");

        assert!(GatewayError::UpstreamTimeout.rejection().is_none());
    }

    #[test]
    fn scope_renders_kind_and_id() {
        assert_eq!(Scope::department("eng").to_string(), "department:eng");
    }

    #[test]
    fn streaming_and_non_object_payloads_are_rejected() {
        assert!(validate_payload(&serde_json::json!({ "stream": true })).is_err());
        assert!(validate_payload(&serde_json::json!([])).is_err());
        assert!(validate_payload(&serde_json::json!({ "stream": false })).is_ok());
    }

    #[test]
    fn transport_failures_surface_as_bad_gateway() {
        let err: GatewayError = UpstreamFailure::Transport("refused".to_string()).into();
        assert!(matches!(
            err,
            GatewayError::UpstreamError {
                status_code: 502,
                ..
            }
        ));
    }
}
