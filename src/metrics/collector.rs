//! Metrics collector using prometheus-client.
//!
//! Per-target gauges are refreshed from target snapshots whenever the
//! metrics endpoint is scraped; connect and placement counters are bumped
//! inline by the algorithms and the dispatcher.

use crate::backend::TargetSnapshot;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;

/// Labels for per-target metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TargetLabels {
    pub target: String,
}

/// Labels for per-target byte counts.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BytesLabels {
    pub target: String,
    pub direction: ByteDirection,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ByteDirection {
    ClientToServer,
    ServerToClient,
}

/// Labels for outbound connect attempts.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectLabels {
    pub result: ConnectResult,
}

/// How an outbound connect attempt ended.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ConnectResult {
    Success,
    Failure,
    Timeout,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub target: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// 1 if the target is enabled, 0 otherwise.
    target_enabled: Family<TargetLabels, Gauge>,
    /// Connections currently tracked by the target.
    target_active_connections: Family<TargetLabels, Gauge>,
    /// Connections ever handed to the target.
    target_connections: Family<TargetLabels, Gauge>,
    /// Current consecutive connect failures.
    target_failures: Family<TargetLabels, Gauge>,
    /// Bytes relayed, per direction.
    target_bytes: Family<BytesLabels, Gauge>,
    /// Outbound connect attempts by result.
    connect_attempts: Family<ConnectLabels, Counter>,
    /// Clients closed because no algorithm could place them.
    clients_abandoned: Counter,
    /// Health check results counter.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let target_enabled = Family::<TargetLabels, Gauge>::default();
        let target_active_connections = Family::<TargetLabels, Gauge>::default();
        let target_connections = Family::<TargetLabels, Gauge>::default();
        let target_failures = Family::<TargetLabels, Gauge>::default();
        let target_bytes = Family::<BytesLabels, Gauge>::default();
        let connect_attempts = Family::<ConnectLabels, Counter>::default();
        let clients_abandoned = Counter::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();

        registry.register(
            "tcplb_target_enabled",
            "Whether the target accepts new clients (1=enabled, 0=disabled)",
            target_enabled.clone(),
        );
        registry.register(
            "tcplb_target_active_connections",
            "Connections currently tracked by the target",
            target_active_connections.clone(),
        );
        registry.register(
            "tcplb_target_connections",
            "Connections ever handed to the target",
            target_connections.clone(),
        );
        registry.register(
            "tcplb_target_failures",
            "Consecutive failed connects to the target",
            target_failures.clone(),
        );
        registry.register(
            "tcplb_target_bytes",
            "Bytes relayed through the target",
            target_bytes.clone(),
        );
        registry.register(
            "tcplb_connect_attempts",
            "Outbound connect attempts by result",
            connect_attempts.clone(),
        );
        registry.register(
            "tcplb_clients_abandoned",
            "Clients closed because no algorithm could place them",
            clients_abandoned.clone(),
        );
        registry.register(
            "tcplb_health_checks",
            "Total number of health checks performed",
            health_checks_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                target_enabled,
                target_active_connections,
                target_connections,
                target_failures,
                target_bytes,
                connect_attempts,
                clients_abandoned,
                health_checks_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Replace every per-target gauge with the given snapshots.
    ///
    /// Targets that are not in `targets` disappear from the output.
    pub fn refresh_targets(&self, targets: &[TargetSnapshot]) {
        let inner = &self.inner;
        inner.target_enabled.clear();
        inner.target_active_connections.clear();
        inner.target_connections.clear();
        inner.target_failures.clear();
        inner.target_bytes.clear();

        for snapshot in targets {
            let labels = TargetLabels {
                target: snapshot.address.to_string(),
            };
            inner
                .target_enabled
                .get_or_create(&labels)
                .set(if snapshot.enabled { 1 } else { 0 });
            inner
                .target_active_connections
                .get_or_create(&labels)
                .set(saturating_i64(snapshot.active_connections as u64));
            inner
                .target_connections
                .get_or_create(&labels)
                .set(saturating_i64(snapshot.total_connections));
            inner
                .target_failures
                .get_or_create(&labels)
                .set(i64::from(snapshot.failure_count));

            for (direction, bytes) in [
                (ByteDirection::ClientToServer, snapshot.bytes_client_to_server),
                (ByteDirection::ServerToClient, snapshot.bytes_server_to_client),
            ] {
                let labels = BytesLabels {
                    target: labels.target.clone(),
                    direction,
                };
                inner.target_bytes.get_or_create(&labels).set(saturating_i64(bytes));
            }
        }
    }

    /// Count an outbound connect attempt.
    pub fn record_connect_attempt(&self, result: ConnectResult) {
        self.inner
            .connect_attempts
            .get_or_create(&ConnectLabels { result })
            .inc();
    }

    /// Count a client that ran off the end of the algorithm chain.
    pub fn record_client_abandoned(&self) {
        self.inner.clients_abandoned.inc();
    }

    /// Record a health check result.
    pub fn record_health_check(&self, target: SocketAddr, success: bool) {
        let labels = HealthCheckLabels {
            target: target.to_string(),
            result: if success {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    fn encoded(collector: &MetricsCollector) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, collector.registry()).unwrap();
        buffer
    }

    fn snapshot(port: u16, enabled: bool) -> TargetSnapshot {
        TargetSnapshot {
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            enabled,
            failure_count: 2,
            active_connections: 3,
            total_connections: 10,
            bytes_client_to_server: 100,
            bytes_server_to_client: 200,
        }
    }

    #[test]
    fn test_refresh_targets() {
        let collector = MetricsCollector::new();
        collector.refresh_targets(&[snapshot(9001, true), snapshot(9002, false)]);

        let output = encoded(&collector);
        assert!(output.contains("tcplb_target_enabled{target=\"127.0.0.1:9001\"} 1"));
        assert!(output.contains("tcplb_target_enabled{target=\"127.0.0.1:9002\"} 0"));
        assert!(output.contains("tcplb_target_active_connections{target=\"127.0.0.1:9001\"} 3"));
        assert!(output.contains("direction=\"ServerToClient\""));
    }

    #[test]
    fn test_removed_targets_disappear() {
        let collector = MetricsCollector::new();
        collector.refresh_targets(&[snapshot(9001, true), snapshot(9002, true)]);
        collector.refresh_targets(&[snapshot(9001, true)]);

        let output = encoded(&collector);
        assert!(output.contains("127.0.0.1:9001"));
        assert!(!output.contains("127.0.0.1:9002"));
    }

    #[test]
    fn test_counters() {
        let collector = MetricsCollector::new();
        collector.record_connect_attempt(ConnectResult::Success);
        collector.record_connect_attempt(ConnectResult::Timeout);
        collector.record_client_abandoned();
        collector.record_health_check("127.0.0.1:9001".parse().unwrap(), false);

        let output = encoded(&collector);
        assert!(output.contains("tcplb_connect_attempts_total{result=\"Timeout\"} 1"));
        assert!(output.contains("tcplb_clients_abandoned_total 1"));
        assert!(output.contains("tcplb_health_checks_total"));
    }
}
