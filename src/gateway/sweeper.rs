use std::sync::Arc;
use std::time::Duration;

use super::{CheckAllOutcome, Gateway};

struct SweepTask(tokio::task::JoinHandle<()>);

impl Drop for SweepTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Periodic bulk endpoint check. One task per sweeper; it shares the
/// gateway's in-flight flag with the admin "check all" action.
pub struct HealthSweeper {
    gateway: Arc<Gateway>,
    interval: Duration,
    task: Option<SweepTask>,
}

impl HealthSweeper {
    pub fn new(gateway: Arc<Gateway>, interval: Duration) -> Self {
        Self {
            gateway,
            interval: interval.max(Duration::from_secs(1)),
            task: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| !task.0.is_finished())
    }

    /// Returns false if the sweeper was already running.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return false;
        }
        let gateway = self.gateway.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; sweeping starts one interval in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match gateway.check_all_endpoints().await {
                    CheckAllOutcome::Completed { endpoints } => {
                        let unhealthy = endpoints
                            .iter()
                            .filter(|status| !status.health.is_healthy)
                            .count();
                        tracing::debug!(
                            endpoints = endpoints.len(),
                            unhealthy,
                            "health sweep finished"
                        );
                    }
                    CheckAllOutcome::AlreadyRunning => {
                        tracing::debug!("health sweep skipped; check already in flight");
                    }
                }
            }
        });
        self.task = Some(SweepTask(handle));
        tracing::info!(interval_secs = interval.as_secs(), "health sweeper started");
        true
    }

    /// Returns false if there was nothing to stop.
    pub fn stop(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                drop(task);
                tracing::info!("health sweeper stopped");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::config::{CachedConfig, GatewayConfig};
    use crate::gateway::memory_store::MemoryCounterStore;
    use crate::gateway::upstream::HttpUpstream;

    fn gateway() -> Arc<Gateway> {
        let config = CachedConfig::fixed(GatewayConfig::default()).expect("config");
        Arc::new(Gateway::new(
            Arc::new(config),
            Arc::new(MemoryCounterStore::new()),
            Arc::new(HttpUpstream::new().expect("client")),
        ))
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let mut sweeper = HealthSweeper::new(gateway(), Duration::from_secs(60));
        assert!(!sweeper.is_running());
        assert!(sweeper.start());
        assert!(!sweeper.start());
        assert!(sweeper.is_running());

        assert!(sweeper.stop());
        assert!(!sweeper.stop());
        assert!(!sweeper.is_running());
        assert!(sweeper.start());
    }

    #[test]
    fn interval_has_a_floor() {
        let sweeper = HealthSweeper::new(gateway(), Duration::ZERO);
        assert_eq!(sweeper.interval(), Duration::from_secs(1));
    }
}
