//! Phase traits a plugin implements. Modeled as composition over
//! inheritance: a single plugin type may implement any
//! subset of these traits (the secret injector is both a `RequestPlugin`
//! and a `PlaceholderProvider`; the host filter is only a `GatePlugin`).
//! The registry hands back a [`PluginBundle`] of `Option<Arc<dyn _>>`
//! rather than forcing every plugin through one god-trait with a
//! `phases()` method.

use netguard_core::types::{GateVerdict, HttpRequest, HttpResponse, RequestDecision, ResponseDecision, RouteDecision};
use netguard_core::EngineError;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Overall per-request time budget a [`PluginContext`] inherits, mirroring
/// the upstream dial timeout — the largest single budget named for a
/// request in flight. Plugins that hand a remaining-time figure to a
/// sub-call (e.g. the network-hook callback client) take the longer of
/// this and their own configured timeout, never the shorter.
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Per-request scratch space threaded through all four phases. Plugins
/// use `vars` to pass data to later phases of the same request (e.g. the
/// local-model router stashes the matched route so the response phase
/// can tag `X-Routed-Via`).
#[derive(Debug)]
pub struct PluginContext {
    pub client_ip: String,
    pub vars: HashMap<String, serde_json::Value>,
    pub started_at: Instant,
    deadline: Instant,
}

impl PluginContext {
    pub fn new(client_ip: impl Into<String>) -> Self {
        let started_at = Instant::now();
        Self {
            client_ip: client_ip.into(),
            vars: HashMap::new(),
            started_at,
            deadline: started_at + DEFAULT_REQUEST_DEADLINE,
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64() * 1000.0
    }

    /// Time left until the context's overall deadline, zero once passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

pub trait GatePlugin: Send + Sync {
    fn name(&self) -> &str;
    fn gate(&self, host: &str, ctx: &mut PluginContext) -> GateVerdict;
}

pub trait RoutePlugin: Send + Sync {
    fn name(&self) -> &str;
    /// May mutate `req` as part of deciding the directive. Per §4.3, that
    /// mutation is only retained on a match — callers are expected to
    /// restore the original request when `route()` returns no directive.
    fn route(&self, req: &mut HttpRequest, host: &str, ctx: &mut PluginContext) -> RouteDecision;
}

pub trait RequestPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn on_request(
        &self,
        req: HttpRequest,
        host: &str,
        ctx: &mut PluginContext,
    ) -> Result<RequestDecision, EngineError>;
}

pub trait ResponsePlugin: Send + Sync {
    fn name(&self) -> &str;
    fn on_response(
        &self,
        resp: HttpResponse,
        req: &HttpRequest,
        host: &str,
        ctx: &mut PluginContext,
    ) -> Result<ResponseDecision, EngineError>;
}

pub trait PlaceholderProvider: Send + Sync {
    fn name(&self) -> &str;
    fn placeholders(&self) -> HashMap<String, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_starts_with_empty_vars() {
        let ctx = PluginContext::new("1.2.3.4");
        assert!(ctx.vars.is_empty());
        assert_eq!(ctx.client_ip, "1.2.3.4");
    }

    #[test]
    fn elapsed_ms_is_nonnegative_and_monotonic() {
        let ctx = PluginContext::new("1.2.3.4");
        let a = ctx.elapsed_ms();
        let b = ctx.elapsed_ms();
        assert!(a >= 0.0);
        assert!(b >= a);
    }

    #[test]
    fn remaining_starts_near_the_default_deadline_and_decreases() {
        let ctx = PluginContext::new("1.2.3.4");
        let r = ctx.remaining();
        assert!(r <= DEFAULT_REQUEST_DEADLINE);
        assert!(r > DEFAULT_REQUEST_DEADLINE - Duration::from_secs(1));
    }
}
