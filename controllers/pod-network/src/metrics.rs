//! Metrics sink
//!
//! The reconciler reports through [`MetricsSink`]; exposing the registry over
//! HTTP is left to the embedding process.

use crate::ipam::{IpFamily, PoolUsage};
use prometheus::{Histogram, HistogramOpts, IntGaugeVec, Opts, Registry};
use std::time::Duration;

const NAMESPACE: &str = "ovnkube";
const SUBSYSTEM: &str = "master";

/// Receiver of controller measurements
pub trait MetricsSink: Send + Sync {
    /// Time from pod scheduling until its port was committed.
    fn record_pod_created(&self, latency: Duration);

    /// Address usage of one switch pool.
    fn record_pool_usage(&self, switch: &str, usage: &PoolUsage);
}

/// Discards every measurement
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_pod_created(&self, _latency: Duration) {}

    fn record_pool_usage(&self, _switch: &str, _usage: &PoolUsage) {}
}

/// Prometheus-backed metrics
#[derive(Debug, Clone)]
pub struct PrometheusMetrics {
    pod_creation_latency: Histogram,
    allocated_pod_ips: IntGaugeVec,
}

impl PrometheusMetrics {
    /// Create the metrics and register them into `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let pod_creation_latency = Histogram::with_opts(
            HistogramOpts::new(
                "pod_creation_latency_seconds",
                "The latency between pod creation and setting the OVN annotations",
            )
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM)
            .buckets(prometheus::exponential_buckets(0.1, 2.0, 15)?),
        )?;
        let allocated_pod_ips = IntGaugeVec::new(
            Opts::new(
                "allocated_pod_ips",
                "Number of pod addresses allocated per logical switch and family",
            )
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
            &["switch", "family"],
        )?;

        registry.register(Box::new(pod_creation_latency.clone()))?;
        registry.register(Box::new(allocated_pod_ips.clone()))?;

        Ok(Self {
            pod_creation_latency,
            allocated_pod_ips,
        })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_pod_created(&self, latency: Duration) {
        self.pod_creation_latency.observe(latency.as_secs_f64());
    }

    fn record_pool_usage(&self, switch: &str, usage: &PoolUsage) {
        let family = match usage.family {
            IpFamily::V4 => "ipv4",
            IpFamily::V6 => "ipv6",
        };
        self.allocated_pod_ips
            .with_label_values(&[switch, family])
            .set(i64::try_from(usage.allocated).unwrap_or(i64::MAX));
    }
}
