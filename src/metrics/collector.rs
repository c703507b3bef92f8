//! Metrics collector using prometheus-client.
//!
//! Provides probe result counters, per-peer down gauges and round
//! counters for every checked upstream group.

use crate::upstream::{Module, PeerIdentity};
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Labels for per-peer metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PeerLabels {
    pub module: String,
    pub upstream: String,
    pub peer: String,
}

impl From<&PeerIdentity> for PeerLabels {
    fn from(identity: &PeerIdentity) -> Self {
        Self {
            module: identity.module.to_string(),
            upstream: identity.upstream.clone(),
            peer: identity.name.clone(),
        }
    }
}

/// Labels for per-upstream metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
    pub module: String,
    pub upstream: String,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub module: String,
    pub upstream: String,
    pub peer: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
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
    /// Probe results.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// Peer routing flag (1 = down, 0 = up).
    peer_down: Family<PeerLabels, Gauge>,
    /// Completed check rounds.
    rounds_total: Family<UpstreamLabels, Counter>,
    /// Shared records held per upstream.
    records: Family<UpstreamLabels, Gauge>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();
        let peer_down = Family::<PeerLabels, Gauge>::default();
        let rounds_total = Family::<UpstreamLabels, Counter>::default();
        let records = Family::<UpstreamLabels, Gauge>::default();

        registry.register(
            "dynhc_health_checks",
            "Total number of health checks performed",
            health_checks_total.clone(),
        );
        registry.register(
            "dynhc_peer_down",
            "Peer routing state (1=down, 0=up)",
            peer_down.clone(),
        );
        registry.register(
            "dynhc_rounds",
            "Total number of completed check rounds",
            rounds_total.clone(),
        );
        registry.register(
            "dynhc_records",
            "Health records held in the shared zone",
            records.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                health_checks_total,
                peer_down,
                rounds_total,
                records,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a probe result.
    pub fn record_probe(&self, identity: &PeerIdentity, result: HealthCheckResult) {
        let labels = HealthCheckLabels {
            module: identity.module.to_string(),
            upstream: identity.upstream.clone(),
            peer: identity.name.clone(),
            result,
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Update a peer's routing state.
    pub fn set_peer_down(&self, identity: &PeerIdentity, down: bool) {
        self.inner
            .peer_down
            .get_or_create(&PeerLabels::from(identity))
            .set(i64::from(down));
    }

    /// Record a completed round and the records left after its sweep.
    pub fn record_round(&self, module: Module, upstream: &str, records: usize) {
        let labels = UpstreamLabels {
            module: module.to_string(),
            upstream: upstream.to_string(),
        };
        self.inner.rounds_total.get_or_create(&labels).inc();
        self.inner
            .records
            .get_or_create(&labels)
            .set(i64::try_from(records).unwrap_or(i64::MAX));
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    fn identity() -> PeerIdentity {
        PeerIdentity::new(Module::Stream, "db", "db.local:5432", "10.0.0.3:5432")
    }

    fn encoded(collector: &MetricsCollector) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, collector.registry()).unwrap();
        buffer
    }

    #[test]
    fn test_probe_results_are_counted() {
        let collector = MetricsCollector::new();
        collector.record_probe(&identity(), HealthCheckResult::Success);
        collector.record_probe(&identity(), HealthCheckResult::Failure);
        collector.record_probe(&identity(), HealthCheckResult::Failure);

        let text = encoded(&collector);
        assert!(text.contains("dynhc_health_checks_total"));
        assert!(text.contains("result=\"Failure\"} 2"));
        assert!(text.contains("peer=\"10.0.0.3:5432\""));
    }

    #[test]
    fn test_peer_down_gauge() {
        let collector = MetricsCollector::new();
        collector.set_peer_down(&identity(), true);
        assert!(encoded(&collector).contains("dynhc_peer_down{module=\"stream\",upstream=\"db\",peer=\"10.0.0.3:5432\"} 1"));

        collector.set_peer_down(&identity(), false);
        assert!(encoded(&collector).contains("peer=\"10.0.0.3:5432\"} 0"));
    }

    #[test]
    fn test_round_recording() {
        let collector = MetricsCollector::new();
        collector.record_round(Module::Http, "api", 3);

        let text = encoded(&collector);
        assert!(text.contains("dynhc_rounds_total{module=\"http\",upstream=\"api\"} 1"));
        assert!(text.contains("dynhc_records{module=\"http\",upstream=\"api\"} 3"));
    }
}
