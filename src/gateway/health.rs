use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::config::CircuitBreakerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Still routable, but failures are accumulating toward the threshold.
    Degrading,
    /// Excluded from selection until the cooldown elapses.
    Cooling,
    /// Cooldown elapsed; one trial attempt decides whether it recovers.
    HalfOpen,
}

/// What a recorded failure did to the breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthTransition {
    Counted { consecutive_fails: u32 },
    Tripped { cooldown_until_ms: i64 },
    Reopened { cooldown_until_ms: i64, cooldown_secs: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHealthSnapshot {
    pub endpoint_id: String,
    pub state: HealthState,
    pub is_healthy: bool,
    pub consecutive_fails: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_ms: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct EndpointHealth {
    consecutive_fails: u32,
    cooldown_until_ms: Option<i64>,
    is_healthy: bool,
    // Cooldown applied by the last trip; doubles on each failed half-open attempt.
    cooldown_secs: u64,
    last_error: Option<String>,
    last_checked_ms: Option<i64>,
    // Set while one request holds the half-open trial. Expires after a
    // cooldown so a trial that never reports back cannot wedge the endpoint.
    trial_started_ms: Option<i64>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            consecutive_fails: 0,
            cooldown_until_ms: None,
            is_healthy: true,
            cooldown_secs: 0,
            last_error: None,
            last_checked_ms: None,
            trial_started_ms: None,
        }
    }
}

impl EndpointHealth {
    pub fn state(&self, now_ms: i64) -> HealthState {
        if self.is_healthy {
            if self.consecutive_fails == 0 {
                HealthState::Healthy
            } else {
                HealthState::Degrading
            }
        } else {
            match self.cooldown_until_ms {
                Some(until) if now_ms < until => HealthState::Cooling,
                _ => HealthState::HalfOpen,
            }
        }
    }

    pub fn is_eligible(&self, now_ms: i64) -> bool {
        match self.state(now_ms) {
            HealthState::Cooling => false,
            HealthState::HalfOpen => !self.trial_in_flight(now_ms),
            HealthState::Healthy | HealthState::Degrading => true,
        }
    }

    fn trial_in_flight(&self, now_ms: i64) -> bool {
        self.trial_started_ms
            .is_some_and(|started| now_ms < cooldown_deadline(started, self.cooldown_secs.max(1)))
    }

    /// Claims the endpoint for one attempt. A half-open endpoint is handed to
    /// a single caller until that attempt is recorded or released.
    pub fn try_begin_attempt(&mut self, now_ms: i64) -> bool {
        if !self.is_eligible(now_ms) {
            return false;
        }
        if self.state(now_ms) == HealthState::HalfOpen {
            self.trial_started_ms = Some(now_ms);
        }
        true
    }

    /// Ends a trial whose outcome says nothing about the endpoint.
    pub fn release_trial(&mut self) {
        self.trial_started_ms = None;
    }

    pub fn consecutive_fails(&self) -> u32 {
        self.consecutive_fails
    }

    pub fn record_success(&mut self, now_ms: i64) -> bool {
        let recovered = !self.is_healthy;
        *self = Self {
            last_checked_ms: Some(now_ms),
            ..Self::default()
        };
        recovered
    }

    pub fn record_failure(
        &mut self,
        now_ms: i64,
        breaker: &CircuitBreakerConfig,
        message: String,
    ) -> HealthTransition {
        let state = self.state(now_ms);
        self.consecutive_fails = self.consecutive_fails.saturating_add(1);
        self.last_error = Some(message);
        self.last_checked_ms = Some(now_ms);

        match state {
            HealthState::HalfOpen => self.reopen(now_ms, breaker),
            // A request that started before the trip; the cooldown stands.
            HealthState::Cooling => HealthTransition::Counted {
                consecutive_fails: self.consecutive_fails,
            },
            HealthState::Healthy | HealthState::Degrading => {
                if self.consecutive_fails >= breaker.failure_threshold {
                    self.trip(now_ms, breaker)
                } else {
                    HealthTransition::Counted {
                        consecutive_fails: self.consecutive_fails,
                    }
                }
            }
        }
    }

    /// A failed administrative probe opens the breaker without waiting for
    /// the threshold.
    pub fn record_probe_failure(
        &mut self,
        now_ms: i64,
        breaker: &CircuitBreakerConfig,
        message: String,
    ) -> HealthTransition {
        let state = self.state(now_ms);
        self.consecutive_fails = self
            .consecutive_fails
            .saturating_add(1)
            .max(breaker.failure_threshold);
        self.last_error = Some(message);
        self.last_checked_ms = Some(now_ms);

        match state {
            HealthState::HalfOpen => self.reopen(now_ms, breaker),
            HealthState::Cooling => HealthTransition::Counted {
                consecutive_fails: self.consecutive_fails,
            },
            HealthState::Healthy | HealthState::Degrading => self.trip(now_ms, breaker),
        }
    }

    fn trip(&mut self, now_ms: i64, breaker: &CircuitBreakerConfig) -> HealthTransition {
        self.is_healthy = false;
        self.trial_started_ms = None;
        self.cooldown_secs = breaker.cooldown_seconds;
        let until = cooldown_deadline(now_ms, self.cooldown_secs);
        self.cooldown_until_ms = Some(until);
        HealthTransition::Tripped {
            cooldown_until_ms: until,
        }
    }

    fn reopen(&mut self, now_ms: i64, breaker: &CircuitBreakerConfig) -> HealthTransition {
        let ceiling = breaker.max_cooldown_seconds.max(breaker.cooldown_seconds);
        self.cooldown_secs = self
            .cooldown_secs
            .max(breaker.cooldown_seconds)
            .saturating_mul(2)
            .min(ceiling);
        let until = cooldown_deadline(now_ms, self.cooldown_secs);
        self.cooldown_until_ms = Some(until);
        self.trial_started_ms = None;
        HealthTransition::Reopened {
            cooldown_until_ms: until,
            cooldown_secs: self.cooldown_secs,
        }
    }

    pub fn snapshot(&self, endpoint_id: &str, now_ms: i64) -> EndpointHealthSnapshot {
        EndpointHealthSnapshot {
            endpoint_id: endpoint_id.to_string(),
            state: self.state(now_ms),
            is_healthy: self.is_healthy,
            consecutive_fails: self.consecutive_fails,
            cooldown_until_ms: self.cooldown_until_ms,
            last_error: self.last_error.clone(),
            last_checked_ms: self.last_checked_ms,
        }
    }
}

fn cooldown_deadline(now_ms: i64, secs: u64) -> i64 {
    let millis = i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    now_ms.saturating_add(millis)
}

/// Breaker state for every endpoint this gateway instance has talked to.
/// Endpoints without an entry are healthy.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    states: Mutex<HashMap<String, EndpointHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EndpointHealth>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_eligible(&self, endpoint_id: &str, now_ms: i64) -> bool {
        self.lock()
            .get(endpoint_id)
            .is_none_or(|health| health.is_eligible(now_ms))
    }

    /// Endpoints without an entry are always claimable.
    pub fn try_begin_attempt(&self, endpoint_id: &str, now_ms: i64) -> bool {
        match self.lock().get_mut(endpoint_id) {
            Some(health) => health.try_begin_attempt(now_ms),
            None => true,
        }
    }

    pub fn release_trial(&self, endpoint_id: &str) {
        if let Some(health) = self.lock().get_mut(endpoint_id) {
            health.release_trial();
        }
    }

    pub fn state(&self, endpoint_id: &str, now_ms: i64) -> HealthState {
        self.lock()
            .get(endpoint_id)
            .map_or(HealthState::Healthy, |health| health.state(now_ms))
    }

    /// Returns true when the endpoint was unhealthy before this success.
    pub fn record_success(&self, endpoint_id: &str, now_ms: i64) -> bool {
        let recovered = self
            .lock()
            .entry(endpoint_id.to_string())
            .or_default()
            .record_success(now_ms);
        if recovered {
            tracing::info!(endpoint = endpoint_id, "endpoint recovered");
        }
        recovered
    }

    pub fn record_failure(
        &self,
        endpoint_id: &str,
        now_ms: i64,
        breaker: &CircuitBreakerConfig,
        message: impl Into<String>,
    ) -> HealthTransition {
        let transition = self
            .lock()
            .entry(endpoint_id.to_string())
            .or_default()
            .record_failure(now_ms, breaker, message.into());
        log_transition(endpoint_id, transition);
        transition
    }

    pub fn record_probe_failure(
        &self,
        endpoint_id: &str,
        now_ms: i64,
        breaker: &CircuitBreakerConfig,
        message: impl Into<String>,
    ) -> HealthTransition {
        let transition = self
            .lock()
            .entry(endpoint_id.to_string())
            .or_default()
            .record_probe_failure(now_ms, breaker, message.into());
        log_transition(endpoint_id, transition);
        transition
    }

    pub fn snapshot(&self, endpoint_id: &str, now_ms: i64) -> EndpointHealthSnapshot {
        self.lock()
            .get(endpoint_id)
            .map(|health| health.snapshot(endpoint_id, now_ms))
            .unwrap_or_else(|| EndpointHealth::default().snapshot(endpoint_id, now_ms))
    }

    /// Drops state for endpoints no longer present in configuration.
    pub fn retain<'a>(&self, live: impl IntoIterator<Item = &'a str>) {
        let live: std::collections::HashSet<&str> = live.into_iter().collect();
        self.lock().retain(|id, _| live.contains(id.as_str()));
    }
}

fn log_transition(endpoint_id: &str, transition: HealthTransition) {
    match transition {
        HealthTransition::Counted { consecutive_fails } => {
            tracing::debug!(endpoint = endpoint_id, consecutive_fails, "endpoint failure counted");
        }
        HealthTransition::Tripped { cooldown_until_ms } => {
            tracing::warn!(endpoint = endpoint_id, cooldown_until_ms, "endpoint marked unhealthy");
        }
        HealthTransition::Reopened {
            cooldown_until_ms,
            cooldown_secs,
        } => {
            tracing::warn!(
                endpoint = endpoint_id,
                cooldown_until_ms,
                cooldown_secs,
                "half-open attempt failed; cooling again"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown_seconds: 30,
            max_cooldown_seconds: 100,
        }
    }

    #[test]
    fn trips_after_threshold_and_cools_down() {
        let registry = HealthRegistry::new();
        let breaker = breaker();

        for n in 1..=2 {
            let t = registry.record_failure("a", 0, &breaker, "502");
            assert_eq!(t, HealthTransition::Counted { consecutive_fails: n });
            assert_eq!(registry.state("a", 0), HealthState::Degrading);
            assert!(registry.is_eligible("a", 0));
        }
        let t = registry.record_failure("a", 1_000, &breaker, "502");
        assert_eq!(
            t,
            HealthTransition::Tripped {
                cooldown_until_ms: 31_000
            }
        );
        assert!(!registry.is_eligible("a", 30_999));
        assert_eq!(registry.state("a", 31_000), HealthState::HalfOpen);
        assert!(registry.is_eligible("a", 31_000));
    }

    #[test]
    fn success_resets_fail_count() {
        let registry = HealthRegistry::new();
        registry.record_failure("a", 0, &breaker(), "timeout");
        registry.record_failure("a", 0, &breaker(), "timeout");
        assert!(!registry.record_success("a", 0));

        let snapshot = registry.snapshot("a", 0);
        assert_eq!(snapshot.consecutive_fails, 0);
        assert_eq!(snapshot.state, HealthState::Healthy);
        assert!(snapshot.last_error.is_none());
    }

    #[test]
    fn failed_half_open_attempt_doubles_cooldown_up_to_max() {
        let registry = HealthRegistry::new();
        let breaker = breaker();
        for _ in 0..3 {
            registry.record_failure("a", 0, &breaker, "503");
        }

        let t = registry.record_failure("a", 30_000, &breaker, "503");
        assert_eq!(
            t,
            HealthTransition::Reopened {
                cooldown_until_ms: 90_000,
                cooldown_secs: 60
            }
        );
        let t = registry.record_failure("a", 90_000, &breaker, "503");
        assert_eq!(
            t,
            HealthTransition::Reopened {
                cooldown_until_ms: 190_000,
                cooldown_secs: 100
            }
        );

        assert!(registry.record_success("a", 190_000));
        assert_eq!(registry.state("a", 190_000), HealthState::Healthy);
    }

    #[test]
    fn half_open_endpoint_admits_one_trial_at_a_time() {
        let registry = HealthRegistry::new();
        let breaker = breaker();
        for _ in 0..3 {
            registry.record_failure("a", 0, &breaker, "503");
        }
        assert!(!registry.try_begin_attempt("a", 29_999));

        assert!(registry.try_begin_attempt("a", 30_000));
        assert_eq!(registry.state("a", 30_000), HealthState::HalfOpen);
        assert!(!registry.is_eligible("a", 30_001));
        assert!(!registry.try_begin_attempt("a", 30_001));

        // A failed trial cools the endpoint again with a longer cooldown.
        registry.record_failure("a", 31_000, &breaker, "503");
        assert!(!registry.try_begin_attempt("a", 90_999));
        assert!(registry.try_begin_attempt("a", 91_000));

        // A released trial hands the endpoint to the next caller.
        registry.release_trial("a");
        assert!(registry.try_begin_attempt("a", 91_001));
        assert!(registry.record_success("a", 92_000));
        assert!(registry.try_begin_attempt("a", 92_000));
        assert!(registry.try_begin_attempt("a", 92_000));
    }

    #[test]
    fn abandoned_trial_expires_after_a_cooldown() {
        let registry = HealthRegistry::new();
        let breaker = breaker();
        for _ in 0..3 {
            registry.record_failure("a", 0, &breaker, "timeout");
        }
        assert!(registry.try_begin_attempt("a", 30_000));
        assert!(!registry.try_begin_attempt("a", 59_999));
        assert!(registry.try_begin_attempt("a", 60_000));
    }

    #[test]
    fn healthy_endpoints_take_any_number_of_attempts() {
        let registry = HealthRegistry::new();
        assert!(registry.try_begin_attempt("a", 0));
        registry.record_failure("a", 0, &breaker(), "502");
        assert!(registry.try_begin_attempt("a", 0));
        assert!(registry.try_begin_attempt("a", 0));
    }

    #[test]
    fn late_failure_while_cooling_keeps_deadline() {
        let registry = HealthRegistry::new();
        let breaker = breaker();
        for _ in 0..3 {
            registry.record_failure("a", 0, &breaker, "503");
        }
        registry.record_failure("a", 10_000, &breaker, "503");
        assert_eq!(registry.snapshot("a", 10_000).cooldown_until_ms, Some(30_000));
    }

    #[test]
    fn failed_probe_opens_immediately_and_successful_probe_restores() {
        let registry = HealthRegistry::new();
        let breaker = breaker();
        let t = registry.record_probe_failure("a", 0, &breaker, "connection refused");
        assert!(matches!(t, HealthTransition::Tripped { .. }));
        assert!(!registry.is_eligible("a", 1));

        assert!(registry.record_success("a", 2));
        assert!(registry.is_eligible("a", 2));
    }

    #[test]
    fn retain_forgets_removed_endpoints() {
        let registry = HealthRegistry::new();
        registry.record_failure("a", 0, &breaker(), "x");
        registry.record_failure("b", 0, &breaker(), "x");
        registry.retain(["b"]);
        assert_eq!(registry.snapshot("a", 0).consecutive_fails, 0);
        assert_eq!(registry.snapshot("b", 0).consecutive_fails, 1);
    }
}
