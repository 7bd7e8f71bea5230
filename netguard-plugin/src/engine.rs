//! The policy engine: plugin orchestration, phase ordering, and
//! placeholder aggregation. Grounded on
//! `ando-plugin::pipeline::PluginPipeline`'s bucket-by-phase,
//! short-circuit-on-terminal-result pattern, retyped around the five
//! phase traits instead of one `Plugin` trait with a `phases()` method.

use crate::plugin::{GatePlugin, PlaceholderProvider, PluginContext, RequestPlugin, ResponsePlugin, RoutePlugin};
use crate::registry::PluginBundle;
use chrono::SecondsFormat;
use netguard_core::events::EventEmitter;
use netguard_core::types::{event_types, EventRecord, GateVerdict, HttpRequest, HttpResponse, RouteDecision};
use netguard_core::EngineError;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Engine {
    gates: Vec<Arc<dyn GatePlugin>>,
    routers: Vec<Arc<dyn RoutePlugin>>,
    request_plugins: Vec<Arc<dyn RequestPlugin>>,
    response_plugins: Vec<Arc<dyn ResponsePlugin>>,
    placeholder_providers: Vec<Arc<dyn PlaceholderProvider>>,
    emitter: Arc<dyn EventEmitter>,
    run_id: String,
    agent_system: String,
}

impl Engine {
    pub fn new(run_id: impl Into<String>, agent_system: impl Into<String>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            gates: Vec::new(),
            routers: Vec::new(),
            request_plugins: Vec::new(),
            response_plugins: Vec::new(),
            placeholder_providers: Vec::new(),
            emitter,
            run_id: run_id.into(),
            agent_system: agent_system.into(),
        }
    }

    /// Fold a freshly built plugin's contributions into the pipeline.
    /// Plugins register in two ways: flat config fields compile
    /// straight into built-ins (callers add those bundles directly),
    /// or an explicit `plugins` list entry is resolved through the
    /// registry and folded in here, in list order.
    pub fn register_bundle(&mut self, bundle: PluginBundle) {
        if let Some(g) = bundle.gate {
            self.gates.push(g);
        }
        if let Some(r) = bundle.route {
            self.routers.push(r);
        }
        if let Some(rq) = bundle.request {
            self.request_plugins.push(rq);
        }
        if let Some(rs) = bundle.response {
            self.response_plugins.push(rs);
        }
        if let Some(p) = bundle.placeholder_provider {
            self.placeholder_providers.push(p);
        }
    }

    fn emit(&self, event_type: &str, summary: impl Into<String>, plugin: Option<&str>, data: Option<serde_json::Value>) {
        self.emitter.emit(EventRecord {
            ts: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            run_id: self.run_id.clone(),
            agent_system: self.agent_system.clone(),
            event_type: event_type.to_string(),
            summary: summary.into(),
            plugin: plugin.map(|s| s.to_string()),
            tags: None,
            data,
        });
    }

    /// Phase 1 — Gate. AND semantics: the first gate that denies blocks;
    /// zero gates registered means every host passes.
    pub fn gate(&self, host: &str, ctx: &mut PluginContext) -> GateVerdict {
        for g in &self.gates {
            let verdict = g.gate(host, ctx);
            self.emit(
                event_types::GATE_DECISION,
                format!("gate {} on {host}: allowed={}", g.name(), verdict.allowed),
                Some(g.name()),
                Some(serde_json::json!({"host": host, "allowed": verdict.allowed, "reason": verdict.reason})),
            );
            if !verdict.allowed {
                return verdict;
            }
        }
        GateVerdict::allow("no gate denied")
    }

    /// Phase 2 — Route. First router whose directive is non-empty wins;
    /// later routers are not consulted. Not run on plain HTTP by the
    /// interceptor (no SNI to route on).
    pub fn route(&self, req: &mut HttpRequest, host: &str, ctx: &mut PluginContext) -> RouteDecision {
        for r in &self.routers {
            let decision = r.route(req, host, ctx);
            if decision.directive.is_some() {
                self.emit(
                    event_types::ROUTE_DECISION,
                    format!("route {} matched on {host}", r.name()),
                    Some(r.name()),
                    Some(serde_json::json!({"host": host, "reason": decision.reason})),
                );
                return decision;
            }
        }
        RouteDecision::none("no router matched")
    }

    /// Phase 3 — Request transform. Chain of plugins; the first error
    /// terminates the chain and propagates to the interceptor.
    pub fn on_request(
        &self,
        mut req: HttpRequest,
        host: &str,
        ctx: &mut PluginContext,
    ) -> Result<HttpRequest, EngineError> {
        for p in &self.request_plugins {
            let decision = p.on_request(req, host, ctx)?;
            self.emit(
                event_types::REQUEST_TRANSFORM,
                format!("{} on {host}: {}", p.name(), decision.action),
                Some(p.name()),
                Some(serde_json::json!({"host": host, "action": decision.action, "reason": decision.reason})),
            );
            req = decision.message;
        }
        Ok(req)
    }

    /// Phase 4 — Response transform, symmetric to phase 3. Errors drop
    /// the connection (the interceptor does not attempt to write a
    /// partial response after a response-phase error).
    pub fn on_response(
        &self,
        mut resp: HttpResponse,
        req: &HttpRequest,
        host: &str,
        ctx: &mut PluginContext,
    ) -> Result<HttpResponse, EngineError> {
        for p in &self.response_plugins {
            let decision = p.on_response(resp, req, host, ctx)?;
            self.emit(
                event_types::RESPONSE_TRANSFORM,
                format!("{} on {host}: {}", p.name(), decision.action),
                Some(p.name()),
                Some(serde_json::json!({"host": host, "action": decision.action, "reason": decision.reason})),
            );
            resp = decision.message;
        }
        Ok(resp)
    }

    /// Union every registered provider's `name -> placeholder` map.
    /// Collisions are a configuration error — last-wins, logged loudly
    /// rather than treated as fatal (per §4.3).
    pub fn placeholders(&self) -> HashMap<String, String> {
        let mut all = HashMap::new();
        for provider in &self.placeholder_providers {
            for (name, placeholder) in provider.placeholders() {
                if let Some(prev) = all.insert(name.clone(), placeholder.clone()) {
                    if prev != placeholder {
                        tracing::warn!(
                            secret = %name,
                            provider = provider.name(),
                            "duplicate placeholder name across providers; last registration wins"
                        );
                    }
                }
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netguard_core::types::{HeaderMap, RequestDecision, ResponseDecision, RouteDirective};

    struct AllowGate;
    impl GatePlugin for AllowGate {
        fn name(&self) -> &str { "allow" }
        fn gate(&self, _host: &str, _ctx: &mut PluginContext) -> GateVerdict {
            GateVerdict::allow("ok")
        }
    }

    struct DenyGate;
    impl GatePlugin for DenyGate {
        fn name(&self) -> &str { "deny" }
        fn gate(&self, _host: &str, _ctx: &mut PluginContext) -> GateVerdict {
            GateVerdict::deny("nope")
        }
    }

    fn req(host: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            scheme: "https".into(),
            host: host.into(),
            port: 443,
            path: "/".into(),
            query: String::new(),
            headers: HeaderMap::new(),
            body: vec![],
        }
    }

    #[test]
    fn zero_gates_allows_everything() {
        let engine = Engine::new("r", "sandbox", netguard_core::events::noop());
        let mut ctx = PluginContext::new("1.2.3.4");
        assert!(engine.gate("anything.com", &mut ctx).allowed);
    }

    #[test]
    fn gate_and_semantics_first_deny_wins() {
        let mut engine = Engine::new("r", "sandbox", netguard_core::events::noop());
        engine.register_bundle(PluginBundle { gate: Some(Arc::new(AllowGate)), ..Default::default() });
        engine.register_bundle(PluginBundle { gate: Some(Arc::new(DenyGate)), ..Default::default() });
        let mut ctx = PluginContext::new("1.2.3.4");
        let verdict = engine.gate("anything.com", &mut ctx);
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, "nope");
    }

    #[test]
    fn gate_and_semantics_all_allow() {
        let mut engine = Engine::new("r", "sandbox", netguard_core::events::noop());
        engine.register_bundle(PluginBundle { gate: Some(Arc::new(AllowGate)), ..Default::default() });
        engine.register_bundle(PluginBundle { gate: Some(Arc::new(AllowGate)), ..Default::default() });
        let mut ctx = PluginContext::new("1.2.3.4");
        assert!(engine.gate("anything.com", &mut ctx).allowed);
    }

    struct FirstRouter;
    impl RoutePlugin for FirstRouter {
        fn name(&self) -> &str { "first" }
        fn route(&self, _req: &mut HttpRequest, _host: &str, _ctx: &mut PluginContext) -> RouteDecision {
            RouteDecision::routed(
                RouteDirective { backend_host: "127.0.0.1".into(), backend_port: 1, use_tls: false },
                "first matched",
            )
        }
    }

    struct SecondRouter;
    impl RoutePlugin for SecondRouter {
        fn name(&self) -> &str { "second" }
        fn route(&self, _req: &mut HttpRequest, _host: &str, _ctx: &mut PluginContext) -> RouteDecision {
            RouteDecision::routed(
                RouteDirective { backend_host: "127.0.0.1".into(), backend_port: 2, use_tls: false },
                "second matched",
            )
        }
    }

    #[test]
    fn route_first_wins() {
        let mut engine = Engine::new("r", "sandbox", netguard_core::events::noop());
        engine.register_bundle(PluginBundle { route: Some(Arc::new(FirstRouter)), ..Default::default() });
        engine.register_bundle(PluginBundle { route: Some(Arc::new(SecondRouter)), ..Default::default() });
        let mut ctx = PluginContext::new("1.2.3.4");
        let mut r = req("openrouter.ai");
        let decision = engine.route(&mut r, "openrouter.ai", &mut ctx);
        assert_eq!(decision.directive.unwrap().backend_port, 1);
    }

    #[test]
    fn route_none_when_no_match() {
        let engine = Engine::new("r", "sandbox", netguard_core::events::noop());
        let mut ctx = PluginContext::new("1.2.3.4");
        let mut r = req("example.com");
        assert!(engine.route(&mut r, "example.com", &mut ctx).directive.is_none());
    }

    struct TagRequestPlugin;
    impl RequestPlugin for TagRequestPlugin {
        fn name(&self) -> &str { "tag" }
        fn on_request(&self, mut req: HttpRequest, _host: &str, _ctx: &mut PluginContext) -> Result<RequestDecision, EngineError> {
            req.headers.set("x-tagged", "1");
            Ok(RequestDecision { message: req, action: "no_op".into(), reason: "tagged".into() })
        }
    }

    struct FailingRequestPlugin;
    impl RequestPlugin for FailingRequestPlugin {
        fn name(&self) -> &str { "fail" }
        fn on_request(&self, _req: HttpRequest, _host: &str, _ctx: &mut PluginContext) -> Result<RequestDecision, EngineError> {
            Err(EngineError::SecretLeak { host: "evil.com".into() })
        }
    }

    #[test]
    fn request_chain_applies_in_order_and_propagates_mutation() {
        let mut engine = Engine::new("r", "sandbox", netguard_core::events::noop());
        engine.register_bundle(PluginBundle { request: Some(Arc::new(TagRequestPlugin)), ..Default::default() });
        let mut ctx = PluginContext::new("1.2.3.4");
        let out = engine.on_request(req("api.example.com"), "api.example.com", &mut ctx).unwrap();
        assert_eq!(out.headers.get("x-tagged"), Some("1"));
    }

    #[test]
    fn request_chain_stops_on_first_error() {
        let mut engine = Engine::new("r", "sandbox", netguard_core::events::noop());
        engine.register_bundle(PluginBundle { request: Some(Arc::new(FailingRequestPlugin)), ..Default::default() });
        engine.register_bundle(PluginBundle { request: Some(Arc::new(TagRequestPlugin)), ..Default::default() });
        let mut ctx = PluginContext::new("1.2.3.4");
        let err = engine.on_request(req("evil.com"), "evil.com", &mut ctx).unwrap_err();
        assert!(matches!(err, EngineError::SecretLeak { .. }));
    }

    struct NoOpResponsePlugin;
    impl ResponsePlugin for NoOpResponsePlugin {
        fn name(&self) -> &str { "noop-resp" }
        fn on_response(&self, resp: HttpResponse, _req: &HttpRequest, _host: &str, _ctx: &mut PluginContext) -> Result<ResponseDecision, EngineError> {
            Ok(ResponseDecision { message: resp, action: "no_op".into(), reason: "nothing to do".into() })
        }
    }

    #[test]
    fn response_chain_runs() {
        let mut engine = Engine::new("r", "sandbox", netguard_core::events::noop());
        engine.register_bundle(PluginBundle { response: Some(Arc::new(NoOpResponsePlugin)), ..Default::default() });
        let mut ctx = PluginContext::new("1.2.3.4");
        let resp = HttpResponse { status: 200, headers: HeaderMap::new(), body: vec![] };
        let out = engine.on_response(resp, &req("api.example.com"), "api.example.com", &mut ctx).unwrap();
        assert_eq!(out.status, 200);
    }

    struct ProviderA;
    impl PlaceholderProvider for ProviderA {
        fn name(&self) -> &str { "a" }
        fn placeholders(&self) -> HashMap<String, String> {
            HashMap::from([("API_KEY".to_string(), "SANDBOX_SECRET_AAA".to_string())])
        }
    }

    struct ProviderB;
    impl PlaceholderProvider for ProviderB {
        fn name(&self) -> &str { "b" }
        fn placeholders(&self) -> HashMap<String, String> {
            HashMap::from([("API_KEY".to_string(), "SANDBOX_SECRET_BBB".to_string())])
        }
    }

    #[test]
    fn placeholder_aggregation_last_registration_wins_on_collision() {
        let mut engine = Engine::new("r", "sandbox", netguard_core::events::noop());
        engine.register_bundle(PluginBundle { placeholder_provider: Some(Arc::new(ProviderA)), ..Default::default() });
        engine.register_bundle(PluginBundle { placeholder_provider: Some(Arc::new(ProviderB)), ..Default::default() });
        let map = engine.placeholders();
        assert_eq!(map.get("API_KEY").unwrap(), "SANDBOX_SECRET_BBB");
    }
}
