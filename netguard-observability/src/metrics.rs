//! Request/latency metrics, feature-gated behind `metrics`.
//!
//! Trimmed from `ando-observability::metrics::MetricsCollector`: route/
//! plugin-phase/ingress-egress/Lua-pool gauges dropped (no route concept,
//! no Lua VM, no bandwidth accounting in this engine), VictoriaMetrics
//! push loop dropped (its `reqwest` dependency has no remaining use —
//! see DESIGN.md). What's left tracks request counters and upstream
//! latency.

use netguard_core::metrics::RequestMetrics;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Registry, TextEncoder};

pub struct MetricsCollector {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub request_duration: HistogramVec,
    pub upstream_latency: HistogramVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            prometheus::Opts::new("netguard_requests_total", "Total intercepted HTTP requests")
                .namespace("netguard"),
            &["host", "status"],
        )?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new("netguard_request_duration_seconds", "End-to-end request latency")
                .namespace("netguard")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["host"],
        )?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new("netguard_upstream_latency_seconds", "Upstream response time")
                .namespace("netguard")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["host"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;

        Ok(Self { registry, requests_total, request_duration, upstream_latency })
    }

    pub fn record_request(&self, host: &str, status: u16, duration_secs: f64) {
        self.requests_total.with_label_values(&[host, &status.to_string()]).inc();
        self.request_duration.with_label_values(&[host]).observe(duration_secs);
    }

    pub fn record_upstream_latency(&self, host: &str, duration_secs: f64) {
        self.upstream_latency.with_label_values(&[host]).observe(duration_secs);
    }

    /// Prometheus text exposition format, for a pull-based `/metrics` endpoint.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("failed to construct metrics registry")
    }
}

impl RequestMetrics for MetricsCollector {
    fn record_request(&self, host: &str, status: u16, duration_secs: f64) {
        MetricsCollector::record_request(self, host, status, duration_secs);
    }

    fn record_upstream_latency(&self, host: &str, duration_secs: f64) {
        MetricsCollector::record_upstream_latency(self, host, duration_secs);
    }
}
