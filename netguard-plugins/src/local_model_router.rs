//! Local-model redirect: detects a chat-completions call for a model the
//! operator has mapped to a local backend, rewrites the request onto
//! that backend's wire shape, and routes the connection there instead of
//! upstream. Follows `router.rs`'s precompiled-table-plus-single-lookup
//! shape for the match itself.

use netguard_core::config::LocalModelRoute;
use netguard_core::glob::normalize_host;
use netguard_core::types::{HttpRequest, RouteDecision, RouteDirective};
use netguard_plugin::plugin::{PluginContext, RoutePlugin};
use serde_json::Value;

pub struct LocalModelRouter {
    routes: Vec<LocalModelRoute>,
}

impl LocalModelRouter {
    pub fn new(routes: Vec<LocalModelRoute>) -> Self {
        Self { routes }
    }
}

impl RoutePlugin for LocalModelRouter {
    fn name(&self) -> &str {
        "local-model-router"
    }

    fn route(&self, req: &mut HttpRequest, host: &str, _ctx: &mut PluginContext) -> RouteDecision {
        let host = normalize_host(host);

        let route = match self.routes.iter().find(|r| {
            normalize_host(&r.source_host) == host && req.method.eq_ignore_ascii_case("POST") && req.path == r.path
        }) {
            Some(r) => r,
            None => return RouteDecision::none("no local model route matched"),
        };

        let body: Value = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(_) => return RouteDecision::none("request body is not valid JSON"),
        };

        let model_name = match body.get("model").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => return RouteDecision::none("request body has no \"model\" field"),
        };

        let target = match route.models.get(&model_name) {
            Some(t) => t,
            None => return RouteDecision::none(format!("model {model_name} not in local route table")),
        };

        let backend_host = target.backend_host.clone().unwrap_or_else(|| route.backend_host.clone());
        let backend_port = target.backend_port.unwrap_or(route.backend_port);

        let mut body = body;
        if let Value::Object(map) = &mut body {
            map.insert("model".to_string(), Value::String(target.target.clone()));
            map.remove("route");
            map.remove("transforms");
            map.remove("provider");
        }
        let new_body = serde_json::to_vec(&body).unwrap_or_default();

        req.path = "/v1/chat/completions".to_string();
        req.headers.remove("Authorization");
        req.headers.remove("Http-Referer");
        req.headers.remove("X-Title");
        req.headers.set("Content-Length", new_body.len().to_string());
        req.headers.set("Host", format!("{backend_host}:{backend_port}"));
        req.body = new_body;

        RouteDecision::routed(
            RouteDirective { backend_host, backend_port, use_tls: false },
            format!("model {model_name} routed to local backend"),
        )
    }
}
