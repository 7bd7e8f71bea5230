//! Request-metrics sink abstraction, mirroring [`crate::events::EventEmitter`]:
//! the interceptor holds an `Arc<dyn RequestMetrics>` and never branches on
//! whether an implementation is attached — a no-op absorbs the case where
//! the ambient metrics collector is compiled out.

use std::sync::Arc;

pub trait RequestMetrics: Send + Sync {
    fn record_request(&self, host: &str, status: u16, duration_secs: f64);
    fn record_upstream_latency(&self, host: &str, duration_secs: f64);
}

pub struct NoopMetrics;

impl RequestMetrics for NoopMetrics {
    fn record_request(&self, _host: &str, _status: u16, _duration_secs: f64) {}
    fn record_upstream_latency(&self, _host: &str, _duration_secs: f64) {}
}

pub fn noop() -> Arc<dyn RequestMetrics> {
    Arc::new(NoopMetrics)
}
