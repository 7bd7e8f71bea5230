//! Declarative network-hook rules plus the SSE-aware body transform.
//! Host/path matching reuses `netguard_core::glob`'s `GlobSet` plumbing;
//! the callback dispatch is built directly on `netguard-callback`'s
//! blocking client.

use netguard_callback::{CallbackClient, CallbackRequest, RequestMutation, ResponseMutation, DEFAULT_TIMEOUT};
use netguard_core::config::{InterceptionConfig, NetworkHookRuleConfig};
use netguard_core::glob::{compile_globs, normalize_host};
use netguard_core::types::{HttpRequest, HttpResponse, RequestDecision, ResponseDecision, RuleAction, RulePhase};
use netguard_core::EngineError;
use netguard_plugin::plugin::{PluginContext, RequestPlugin, ResponsePlugin};
use globset::{Glob, GlobMatcher, GlobSet};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

struct CompiledRule {
    phase: RulePhase,
    action: RuleAction,
    host_set: Option<GlobSet>,
    methods: Vec<String>,
    path_glob: Option<GlobMatcher>,
    header_sets: HashMap<String, String>,
    header_deletes: Vec<String>,
    query_sets: HashMap<String, String>,
    query_deletes: Vec<String>,
    rewrite_path: Option<String>,
    response_header_sets: HashMap<String, String>,
    response_header_deletes: Vec<String>,
    body_replacements: Vec<(String, String)>,
    callback_id: Option<String>,
    timeout_ms: Option<u64>,
}

fn compile_rule(cfg: &NetworkHookRuleConfig) -> Result<CompiledRule, EngineError> {
    let phase = match cfg.phase.as_str() {
        "before" => RulePhase::Before,
        "after" => RulePhase::After,
        other => {
            return Err(EngineError::InvalidPluginConfig {
                plugin: "network-hooks".into(),
                reason: format!("unknown rule phase {other:?}"),
            })
        }
    };
    let action = match cfg.action.as_str() {
        "allow" => RuleAction::Allow,
        "block" => RuleAction::Block,
        "mutate" => RuleAction::Mutate,
        other => {
            return Err(EngineError::InvalidPluginConfig {
                plugin: "network-hooks".into(),
                reason: format!("unknown rule action {other:?}"),
            })
        }
    };
    let host_set = if cfg.host_globs.is_empty() {
        None
    } else {
        Some(compile_globs(&cfg.host_globs).map_err(|e| EngineError::InvalidPluginConfig {
            plugin: "network-hooks".into(),
            reason: e.to_string(),
        })?)
    };
    let path_glob = cfg
        .path_glob
        .as_ref()
        .map(|p| {
            Glob::new(p)
                .map(|g| g.compile_matcher())
                .map_err(|e| EngineError::InvalidPluginConfig { plugin: "network-hooks".into(), reason: e.to_string() })
        })
        .transpose()?;

    let mut rule = CompiledRule {
        phase,
        action,
        host_set,
        methods: cfg.methods.clone(),
        path_glob,
        header_sets: cfg.header_sets.clone(),
        header_deletes: cfg.header_deletes.clone(),
        query_sets: cfg.query_sets.clone(),
        query_deletes: cfg.query_deletes.clone(),
        rewrite_path: cfg.rewrite_path.clone(),
        response_header_sets: cfg.response_header_sets.clone(),
        response_header_deletes: cfg.response_header_deletes.clone(),
        body_replacements: cfg.body_replacements.iter().map(|b| (b.find.clone(), b.replace.clone())).collect(),
        callback_id: cfg.callback_id.clone(),
        timeout_ms: cfg.timeout_ms,
    };

    if rule.action == RuleAction::Allow && rule.has_mutation() {
        rule.action = RuleAction::Mutate;
    }

    Ok(rule)
}

impl CompiledRule {
    fn matches(&self, host: &str, method: &str, path: &str) -> bool {
        let host_ok = self.host_set.as_ref().map(|s| s.is_match(normalize_host(host))).unwrap_or(true);
        let method_ok = self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method));
        let path_ok = self.path_glob.as_ref().map(|g| g.is_match(path)).unwrap_or(true);
        host_ok && method_ok && path_ok
    }

    fn timeout(&self) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Deadline handed to the callback client: the longer of the rule's
    /// own timeout and the request context's remaining time budget, never
    /// the shorter of the two.
    fn effective_timeout(&self, ctx: &PluginContext) -> Duration {
        ctx.remaining().max(self.timeout())
    }

    /// Whether this rule carries any static header/query/path/body edit,
    /// for either the request or response side depending on its phase.
    fn has_mutation(&self) -> bool {
        match self.phase {
            RulePhase::Before => {
                !self.header_sets.is_empty()
                    || !self.header_deletes.is_empty()
                    || !self.query_sets.is_empty()
                    || !self.query_deletes.is_empty()
                    || self.rewrite_path.is_some()
            }
            RulePhase::After => {
                !self.response_header_sets.is_empty()
                    || !self.response_header_deletes.is_empty()
                    || !self.body_replacements.is_empty()
            }
        }
    }

    /// A rule does nothing unless it blocks, carries a static mutation, or
    /// defers to a callback that may decide to do either at call time.
    fn is_effective(&self) -> bool {
        self.action == RuleAction::Block || self.has_mutation() || self.callback_id.is_some()
    }
}

pub struct NetworkHooks {
    rules: Vec<CompiledRule>,
    callback_client: Option<CallbackClient>,
}

impl NetworkHooks {
    pub fn new(rules: Vec<NetworkHookRuleConfig>, callback_socket: Option<PathBuf>) -> Result<Self, EngineError> {
        let compiled = rules
            .iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|r| {
                let effective = r.is_effective();
                if !effective {
                    tracing::debug!(phase = ?r.phase, "dropping no-op network hook rule (no mutation, block, or callback)");
                }
                effective
            })
            .collect();
        Ok(Self { rules: compiled, callback_client: callback_socket.map(CallbackClient::new) })
    }

    pub fn from_value(config: &serde_json::Value) -> Result<Self, EngineError> {
        let cfg: InterceptionConfig = serde_json::from_value(config.clone()).map_err(|e| {
            EngineError::InvalidPluginConfig { plugin: "network-hooks".into(), reason: e.to_string() }
        })?;
        Self::new(cfg.rules, cfg.callback_socket)
    }

    fn invoke_callback(
        &self,
        callback_id: &str,
        phase: &str,
        host: &str,
        req: &HttpRequest,
        resp: Option<&HttpResponse>,
        timeout: Duration,
    ) -> Result<netguard_callback::CallbackResponse, EngineError> {
        let client = self
            .callback_client
            .as_ref()
            .ok_or_else(|| EngineError::CallbackError(format!("rule references callback {callback_id} but no callback_socket is configured")))?;

        let request = CallbackRequest {
            callback_id: callback_id.to_string(),
            phase: phase.to_string(),
            host: host.to_string(),
            method: req.method.clone(),
            path: req.path.clone(),
            query: req.query.clone(),
            request_headers: Some(req.headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            response_headers: resp.map(|r| r.headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            status: resp.map(|r| r.status),
        };
        client.call(&request, timeout).inspect_err(|e| {
            tracing::warn!(%callback_id, %phase, %host, error = %e, "network hook callback failed");
        })
    }
}

fn apply_request_mutation(req: &mut HttpRequest, m: &RequestMutation) {
    for (k, v) in &m.header_sets {
        req.headers.set(k, v.clone());
    }
    for k in &m.header_deletes {
        req.headers.remove(k);
    }
    apply_query_mutation(req, &m.query_sets, &m.query_deletes);
    if let Some(path) = &m.rewrite_path {
        req.path = path.clone();
    }
}

fn apply_query_mutation(req: &mut HttpRequest, sets: &HashMap<String, String>, deletes: &[String]) {
    let mut pairs: Vec<(String, String)> = req
        .query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect();
    pairs.retain(|(k, _)| !deletes.iter().any(|d| d == k));
    for (k, v) in sets {
        pairs.retain(|(existing, _)| existing != k);
        pairs.push((k.clone(), v.clone()));
    }
    req.query = pairs.into_iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
}

fn apply_sse_body_replacements(body: &[u8], replacements: &[(String, String)]) -> Vec<u8> {
    let text = String::from_utf8_lossy(body);
    let mut out = String::with_capacity(text.len());
    let mut rest: &str = &text;
    loop {
        let (line, consumed_nl, remainder) = match rest.find('\n') {
            Some(idx) => (&rest[..idx], true, &rest[idx + 1..]),
            None => (rest, false, ""),
        };
        if let Some(payload) = line.strip_prefix("data:") {
            let mut payload = payload.to_string();
            for (find, replace) in replacements {
                payload = payload.replace(find.as_str(), replace.as_str());
            }
            out.push_str("data:");
            out.push_str(&payload);
        } else {
            out.push_str(line);
        }
        if consumed_nl {
            out.push('\n');
        }
        if remainder.is_empty() {
            break;
        }
        rest = remainder;
    }
    out.into_bytes()
}

fn is_event_stream(resp: &HttpResponse) -> bool {
    resp.headers.get("Content-Type").map(|ct| ct.starts_with("text/event-stream")).unwrap_or(false)
}

fn apply_static_response_mutation(resp: &mut HttpResponse, rule: &CompiledRule) {
    for (k, v) in &rule.response_header_sets {
        resp.headers.set(k, v.clone());
    }
    for k in &rule.response_header_deletes {
        resp.headers.remove(k);
    }
    if rule.body_replacements.is_empty() {
        return;
    }
    if is_event_stream(resp) {
        resp.body = apply_sse_body_replacements(&resp.body, &rule.body_replacements);
        resp.headers.remove("Content-Length");
        resp.headers.remove("Transfer-Encoding");
    } else {
        let mut body = String::from_utf8_lossy(&resp.body).into_owned();
        for (find, replace) in &rule.body_replacements {
            body = body.replace(find.as_str(), replace.as_str());
        }
        resp.headers.set("Content-Length", body.len().to_string());
        resp.body = body.into_bytes();
    }
}

fn apply_response_mutation(resp: &mut HttpResponse, m: &ResponseMutation) {
    for (k, v) in &m.header_sets {
        resp.headers.set(k, v.clone());
    }
    for k in &m.header_deletes {
        resp.headers.remove(k);
    }
    if m.body_replacements.is_empty() {
        return;
    }
    let pairs: Vec<(String, String)> = m.body_replacements.iter().map(|b| (b.find.clone(), b.replace.clone())).collect();
    if is_event_stream(resp) {
        resp.body = apply_sse_body_replacements(&resp.body, &pairs);
        resp.headers.remove("Content-Length");
        resp.headers.remove("Transfer-Encoding");
    } else {
        let mut body = String::from_utf8_lossy(&resp.body).into_owned();
        for (find, replace) in &pairs {
            body = body.replace(find.as_str(), replace.as_str());
        }
        resp.headers.set("Content-Length", body.len().to_string());
        resp.body = body.into_bytes();
    }
}

impl RequestPlugin for NetworkHooks {
    fn name(&self) -> &str {
        "network-hooks"
    }

    fn on_request(&self, mut req: HttpRequest, host: &str, ctx: &mut PluginContext) -> Result<RequestDecision, EngineError> {
        let mut mutated = false;
        for rule in self.rules.iter().filter(|r| r.phase == RulePhase::Before) {
            if !rule.matches(host, &req.method, &req.path) {
                continue;
            }

            if let Some(callback_id) = &rule.callback_id {
                let timeout = rule.effective_timeout(ctx);
                let result = self.invoke_callback(callback_id, "before", host, &req, None, timeout)?;
                match result.action.as_str() {
                    "block" => return Err(EngineError::RuleBlocked { reason: format!("callback {callback_id} blocked request") }),
                    "mutate" => {
                        if let Some(m) = &result.request_mutation {
                            apply_request_mutation(&mut req, m);
                            mutated = true;
                        }
                    }
                    _ => {}
                }
                continue;
            }

            match rule.action {
                RuleAction::Block => return Err(EngineError::RuleBlocked { reason: format!("network hook blocked request to {host}") }),
                RuleAction::Mutate => {
                    for (k, v) in &rule.header_sets {
                        req.headers.set(k, v.clone());
                    }
                    for k in &rule.header_deletes {
                        req.headers.remove(k);
                    }
                    apply_query_mutation(&mut req, &rule.query_sets, &rule.query_deletes);
                    if let Some(path) = &rule.rewrite_path {
                        req.path = path.clone();
                    }
                    mutated = true;
                }
                RuleAction::Allow => {}
            }
        }

        let action = if mutated { "mutated" } else { "no_op" };
        Ok(RequestDecision { message: req, action: action.into(), reason: format!("network hooks on {host}") })
    }
}

impl ResponsePlugin for NetworkHooks {
    fn name(&self) -> &str {
        "network-hooks"
    }

    fn on_response(
        &self,
        mut resp: HttpResponse,
        req: &HttpRequest,
        host: &str,
        ctx: &mut PluginContext,
    ) -> Result<ResponseDecision, EngineError> {
        let mut mutated = false;
        for rule in self.rules.iter().filter(|r| r.phase == RulePhase::After) {
            if !rule.matches(host, &req.method, &req.path) {
                continue;
            }

            if let Some(callback_id) = &rule.callback_id {
                let timeout = rule.effective_timeout(ctx);
                let result = self.invoke_callback(callback_id, "after", host, req, Some(&resp), timeout)?;
                match result.action.as_str() {
                    "block" => return Err(EngineError::RuleBlocked { reason: format!("callback {callback_id} blocked response") }),
                    "mutate" => {
                        if let Some(m) = &result.response_mutation {
                            apply_response_mutation(&mut resp, m);
                            mutated = true;
                        }
                    }
                    _ => {}
                }
                continue;
            }

            match rule.action {
                RuleAction::Block => return Err(EngineError::RuleBlocked { reason: format!("network hook blocked response from {host}") }),
                RuleAction::Mutate => {
                    apply_static_response_mutation(&mut resp, rule);
                    mutated = true;
                }
                RuleAction::Allow => {}
            }
        }

        let action = if mutated { "mutated" } else { "no_op" };
        Ok(ResponseDecision { message: resp, action: action.into(), reason: format!("network hooks on {host}") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netguard_core::config::BodyReplacementConfig;
    use netguard_core::types::HeaderMap;

    fn req(host: &str, method: &str, path: &str) -> HttpRequest {
        HttpRequest {
            method: method.into(),
            scheme: "https".into(),
            host: host.into(),
            port: 443,
            path: path.into(),
            query: String::new(),
            headers: HeaderMap::new(),
            body: vec![],
        }
    }

    fn rule(phase: &str, action: &str) -> NetworkHookRuleConfig {
        NetworkHookRuleConfig { phase: phase.into(), action: action.into(), ..Default::default() }
    }

    #[test]
    fn block_rule_fails_request() {
        let hooks = NetworkHooks::new(vec![rule("before", "block")], None).unwrap();
        let mut ctx = PluginContext::new("1.2.3.4");
        let err = hooks.on_request(req("api.example.com", "GET", "/x"), "api.example.com", &mut ctx).unwrap_err();
        assert!(matches!(err, EngineError::RuleBlocked { .. }));
    }

    #[test]
    fn host_glob_restricts_match() {
        let mut r = rule("before", "block");
        r.host_globs = vec!["evil.com".into()];
        let hooks = NetworkHooks::new(vec![r], None).unwrap();
        let mut ctx = PluginContext::new("1.2.3.4");
        assert!(hooks.on_request(req("api.example.com", "GET", "/x"), "api.example.com", &mut ctx).is_ok());
        assert!(hooks.on_request(req("evil.com", "GET", "/x"), "evil.com", &mut ctx).is_err());
    }

    #[test]
    fn mutate_rule_applies_header_and_query_changes() {
        let mut r = rule("before", "mutate");
        r.header_sets = HashMap::from([("x-injected".to_string(), "yes".to_string())]);
        r.header_deletes = vec!["x-remove".into()];
        r.query_sets = HashMap::from([("k".to_string(), "v".to_string())]);
        let hooks = NetworkHooks::new(vec![r], None).unwrap();
        let mut request = req("api.example.com", "GET", "/x");
        request.headers.push("x-remove", "bye");
        let mut ctx = PluginContext::new("1.2.3.4");
        let decision = hooks.on_request(request, "api.example.com", &mut ctx).unwrap();
        assert_eq!(decision.action, "mutated");
        assert_eq!(decision.message.headers.get("x-injected"), Some("yes"));
        assert!(decision.message.headers.get("x-remove").is_none());
        assert_eq!(decision.message.query, "k=v");
    }

    #[test]
    fn sse_replacement_only_touches_data_lines() {
        let mut r = rule("after", "mutate");
        r.body_replacements = vec![BodyReplacementConfig { find: "foo".into(), replace: "bar".into() }];
        let hooks = NetworkHooks::new(vec![r], None).unwrap();
        let mut headers = HeaderMap::new();
        headers.set("Content-Type", "text/event-stream");
        let resp = HttpResponse {
            status: 200,
            headers,
            body: b"id:1\ndata: foo first\nevent: message\ndata: second foo\n\n".to_vec(),
        };
        let mut ctx = PluginContext::new("1.2.3.4");
        let decision = hooks.on_response(resp, &req("api.example.com", "GET", "/x"), "api.example.com", &mut ctx).unwrap();
        assert_eq!(
            decision.message.body,
            b"id:1\ndata: bar first\nevent: message\ndata: second bar\n\n".to_vec()
        );
        assert!(decision.message.headers.get("Content-Length").is_none());
    }

    #[test]
    fn allow_rule_with_mutation_is_promoted_and_applied() {
        let mut r = rule("before", "allow");
        r.header_sets = HashMap::from([("x-injected".to_string(), "yes".to_string())]);
        let hooks = NetworkHooks::new(vec![r], None).unwrap();
        let mut ctx = PluginContext::new("1.2.3.4");
        let decision = hooks.on_request(req("api.example.com", "GET", "/x"), "api.example.com", &mut ctx).unwrap();
        assert_eq!(decision.action, "mutated");
        assert_eq!(decision.message.headers.get("x-injected"), Some("yes"));
    }

    #[test]
    fn allow_rule_with_no_mutation_is_dropped_at_compile_time() {
        let hooks = NetworkHooks::new(vec![rule("before", "allow")], None).unwrap();
        assert!(hooks.rules.is_empty());
    }

    #[test]
    fn mutate_rule_with_no_configured_mutation_is_dropped_at_compile_time() {
        let hooks = NetworkHooks::new(vec![rule("after", "mutate")], None).unwrap();
        assert!(hooks.rules.is_empty());
    }

    #[test]
    fn callback_rule_survives_compile_even_with_no_static_mutation() {
        let mut r = rule("before", "allow");
        r.callback_id = Some("rule-1".into());
        let hooks = NetworkHooks::new(vec![r], Some(PathBuf::from("/tmp/does-not-matter.sock"))).unwrap();
        assert_eq!(hooks.rules.len(), 1);
    }

    #[test]
    fn block_rule_with_no_mutation_survives_compile() {
        let hooks = NetworkHooks::new(vec![rule("before", "block")], None).unwrap();
        assert_eq!(hooks.rules.len(), 1);
    }

    #[test]
    fn effective_timeout_prefers_a_longer_context_deadline_over_the_default() {
        let mut r = rule("before", "allow");
        r.callback_id = Some("rule-1".into());
        let compiled = compile_rule(&r).unwrap();
        let ctx = PluginContext::new("1.2.3.4");
        // No explicit rule.timeout_ms falls back to the 2s default; the
        // fresh context's ~30s remaining budget is longer and wins.
        assert!(compiled.effective_timeout(&ctx) > DEFAULT_TIMEOUT);
    }

    #[test]
    fn effective_timeout_prefers_a_longer_rule_timeout_over_the_context_deadline() {
        let mut r = rule("before", "allow");
        r.callback_id = Some("rule-1".into());
        r.timeout_ms = Some(60_000);
        let compiled = compile_rule(&r).unwrap();
        let ctx = PluginContext::new("1.2.3.4");
        assert_eq!(compiled.effective_timeout(&ctx), Duration::from_millis(60_000));
    }

    #[test]
    fn method_and_path_glob_restrict_match() {
        let mut r = rule("before", "block");
        r.methods = vec!["POST".into()];
        r.path_glob = Some("/v1/*".into());
        let hooks = NetworkHooks::new(vec![r], None).unwrap();
        let mut ctx = PluginContext::new("1.2.3.4");
        assert!(hooks.on_request(req("api.example.com", "GET", "/v1/x"), "api.example.com", &mut ctx).is_ok());
        assert!(hooks.on_request(req("api.example.com", "POST", "/other"), "api.example.com", &mut ctx).is_ok());
        assert!(hooks.on_request(req("api.example.com", "POST", "/v1/x"), "api.example.com", &mut ctx).is_err());
    }
}
