//! Active health checker.
//!
//! Periodically probes every registered target and flips its enabled state
//! to match the result.

use crate::backend::{Target, TargetRegistry};
use crate::health::HealthProbe;
use crate::metrics::MetricsCollector;
use crate::util::ShutdownListener;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Active health checker that probes targets.
pub struct HealthChecker {
    registry: Arc<TargetRegistry>,
    probe: Arc<dyn HealthProbe>,
    /// Time between rounds.
    interval: Duration,
    /// Limit for a single probe.
    timeout: Duration,
    metrics: MetricsCollector,
}

impl HealthChecker {
    /// Create a new health checker.
    pub fn new(
        registry: Arc<TargetRegistry>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        timeout: Duration,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            registry,
            probe,
            interval,
            timeout,
            metrics,
        }
    }

    /// Start the health checker background task.
    pub async fn run(self, mut shutdown: ShutdownListener) {
        info!(interval = ?self.interval, timeout = ?self.timeout, "health checker starting");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Targets added between rounds are picked up here.
                    self.check_all().await;
                }

                _ = shutdown.recv() => {
                    info!("health checker shutting down");
                    break;
                }
            }
        }
    }

    /// Probe every target once, concurrently.
    pub async fn check_all(&self) {
        let targets = self.registry.targets();
        join_all(targets.iter().map(|target| self.check(target))).await;
    }

    /// Probe one target and apply the result.
    ///
    /// Returns whether the probe passed.
    pub async fn check(&self, target: &Arc<Target>) -> bool {
        let address = target.address();
        let result = self.probe.probe(address, self.timeout).await;
        self.metrics.record_health_check(address, result.is_ok());

        match result {
            Ok(()) => {
                debug!(target = %address, "health check passed");
                if !target.is_enabled() {
                    info!(target = %address, "health check passed, enabling target");
                    target.enable();
                }
                true
            }
            Err(e) => {
                if target.is_enabled() {
                    warn!(target = %address, error = %e, "health check failed, disabling target");
                    target.disable();
                } else {
                    debug!(target = %address, error = %e, "health check failed");
                }
                false
            }
        }
    }
}
