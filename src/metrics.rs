use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SessionLabels {
    pub operation: OperationLabel,
    pub outcome: SessionOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OperationLabel {
    Fetch,
    Push,
    Invalid,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SessionOutcome {
    Ok,
    Rejected,
    TransportFailed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PagesLabels {
    pub outcome: PagesOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum PagesOutcome {
    Published,
    Skipped,
    Failed,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
pub struct Metrics {
    // -- sessions --
    pub sessions_total: Family<SessionLabels, Counter>,
    pub transport_duration_seconds: Histogram,
    pub active_sessions: Gauge,

    // -- hooks --
    pub hook_runs_total: Counter,
    pub hook_failures_total: Counter,

    // -- pages --
    pub pages_runs_total: Family<PagesLabels, Counter>,
    pub pages_build_duration_seconds: Histogram,
    pub lock_waits: Counter,
    pub lock_timeouts: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let sessions_total = Family::<SessionLabels, Counter>::default();
        registry.register(
            "pushgate_sessions_total",
            "SSH command sessions by operation and outcome",
            sessions_total.clone(),
        );

        let transport_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        registry.register(
            "pushgate_transport_duration_seconds",
            "Backend transport run time in seconds",
            transport_duration_seconds.clone(),
        );

        let active_sessions: Gauge = Gauge::default();
        registry.register(
            "pushgate_active_sessions",
            "Currently running command sessions",
            active_sessions.clone(),
        );

        let hook_runs_total = Counter::default();
        registry.register(
            "pushgate_hook_runs_total",
            "Post-receive hook invocations",
            hook_runs_total.clone(),
        );

        let hook_failures_total = Counter::default();
        registry.register(
            "pushgate_hook_failures_total",
            "Post-receive hook invocations that failed",
            hook_failures_total.clone(),
        );

        let pages_runs_total = Family::<PagesLabels, Counter>::default();
        registry.register(
            "pushgate_pages_runs_total",
            "Pages pipeline runs by outcome",
            pages_runs_total.clone(),
        );

        let pages_build_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 12));
        registry.register(
            "pushgate_pages_build_duration_seconds",
            "Pages pipeline run time in seconds (non-skipped runs)",
            pages_build_duration_seconds.clone(),
        );

        let lock_waits = Counter::default();
        registry.register(
            "pushgate_lock_waits_total",
            "Pages runs that had to wait for the repository lock",
            lock_waits.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "pushgate_lock_timeouts_total",
            "Pages runs that gave up waiting for the repository lock",
            lock_timeouts.clone(),
        );

        Self {
            sessions_total,
            transport_duration_seconds,
            active_sessions,
            hook_runs_total,
            hook_failures_total,
            pages_runs_total,
            pages_build_duration_seconds,
            lock_waits,
            lock_timeouts,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared by every session.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
