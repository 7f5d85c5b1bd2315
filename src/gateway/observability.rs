use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::GatewayError;

const LATENCY_WINDOW: usize = 1024;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub samples: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub admitted: u64,
    pub unauthorized: u64,
    pub rate_limited: u64,
    pub budget_exceeded: u64,
    pub no_healthy_endpoint: u64,
    pub upstream_errors: u64,
    pub failovers: u64,
    pub store_errors: u64,
    pub latency: LatencySnapshot,
}

#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    admitted: AtomicU64,
    unauthorized: AtomicU64,
    rate_limited: AtomicU64,
    budget_exceeded: AtomicU64,
    no_healthy_endpoint: AtomicU64,
    upstream_errors: AtomicU64,
    failovers: AtomicU64,
    store_errors: AtomicU64,
    // Most recent completed-request latencies in milliseconds.
    latencies: Mutex<VecDeque<u64>>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_admitted(&self) {
        bump(&self.admitted);
    }

    pub fn record_failover(&self) {
        bump(&self.failovers);
    }

    pub fn record_store_error(&self) {
        bump(&self.store_errors);
    }

    pub fn record_error(&self, err: &GatewayError) {
        match err {
            GatewayError::Unauthorized => bump(&self.unauthorized),
            GatewayError::LimitExceeded { .. } => bump(&self.rate_limited),
            GatewayError::BudgetExceeded { .. } => bump(&self.budget_exceeded),
            GatewayError::NoHealthyEndpoint { .. } => bump(&self.no_healthy_endpoint),
            GatewayError::UpstreamTimeout | GatewayError::UpstreamError { .. } => {
                bump(&self.upstream_errors)
            }
            GatewayError::CounterStoreUnavailable { .. } => bump(&self.store_errors),
            GatewayError::UnknownModel { .. }
            | GatewayError::UnknownEndpoint { .. }
            | GatewayError::InvalidRequest { .. } => {}
        }
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let mut latencies = self
            .latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(ms);
    }

    fn latency(&self) -> LatencySnapshot {
        let mut sorted: Vec<u64> = self
            .latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        sorted.sort_unstable();
        LatencySnapshot {
            samples: sorted.len(),
            p50_ms: percentile(&sorted, 50),
            p95_ms: percentile(&sorted, 95),
            p99_ms: percentile(&sorted, 99),
        }
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ObservabilitySnapshot {
            requests: load(&self.requests),
            admitted: load(&self.admitted),
            unauthorized: load(&self.unauthorized),
            rate_limited: load(&self.rate_limited),
            budget_exceeded: load(&self.budget_exceeded),
            no_healthy_endpoint: load(&self.no_healthy_endpoint),
            upstream_errors: load(&self.upstream_errors),
            failovers: load(&self.failovers),
            store_errors: load(&self.store_errors),
            latency: self.latency(),
        }
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let obs = Observability::default();
        for ms in 1..=100 {
            obs.record_latency(Duration::from_millis(ms));
        }
        let latency = obs.snapshot().latency;
        assert_eq!(latency.samples, 100);
        assert_eq!((latency.p50_ms, latency.p95_ms, latency.p99_ms), (50, 95, 99));
    }

    #[test]
    fn latency_window_is_bounded() {
        let obs = Observability::default();
        for _ in 0..(LATENCY_WINDOW + 10) {
            obs.record_latency(Duration::from_millis(5));
        }
        assert_eq!(obs.snapshot().latency.samples, LATENCY_WINDOW);
    }

    #[test]
    fn errors_land_in_their_counter() {
        let obs = Observability::default();
        obs.record_error(&GatewayError::UpstreamTimeout);
        obs.record_error(&GatewayError::NoHealthyEndpoint {
            model_id: "m".to_string(),
        });
        let snapshot = obs.snapshot();
        assert_eq!(snapshot.upstream_errors, 1);
        assert_eq!(snapshot.no_healthy_endpoint, 1);
        assert_eq!(snapshot.requests, 0);
    }
}
