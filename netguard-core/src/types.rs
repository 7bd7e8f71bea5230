//! Data model shared across the policy engine, plugins, and interceptor.
//!
//! Sum-type decisions (`GateVerdict`, `RouteDecision`, …) are modeled as
//! explicit structs/enums rather than leaking sentinel values — an empty
//! `Option<RouteDirective>` means "no route", never a zero-valued struct.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

// ───────────────────────────── HTTP message model ─────────────────────────

/// Case-insensitive, order-preserving header multimap.
///
/// Grounded on the interceptor's need to forward headers exactly as
/// received except for the handful it explicitly strips or rewrites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap(Vec<(String, String)>);

impl HeaderMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.push(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Apply `value` to every occurrence of `name`, replacing occurrences
    /// of `find` inside the value with `replace`. Returns the number of
    /// values touched.
    pub fn replace_substring_in(&mut self, find: &str, replace: &str) -> usize {
        let mut count = 0;
        for (_, v) in self.0.iter_mut() {
            if v.contains(find) {
                *v = v.replace(find, replace);
                count += 1;
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An in-flight request as seen by the policy engine.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub scheme: String,
    /// Effective host, stripped of port, lower-cased.
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: String,
    pub headers: HeaderMap,
    /// Bounded body buffer (route-phase peeking requires read-then-restore;
    /// capped at 10 MiB).
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

    pub fn host_header(&self) -> String {
        match self.port {
            80 | 443 => self.host.clone(),
            p => format!("{}:{}", self.host, p),
        }
    }

    /// Replace every occurrence of `find` with `replace` across header
    /// values and the raw query string. Never touches the body — the
    /// secret injector relies on that guarantee.
    pub fn replace_in_headers_and_query(&mut self, find: &str, replace: &str) -> usize {
        let mut count = self.headers.replace_substring_in(find, replace);
        if self.query.contains(find) {
            count += 1;
            self.query = self.query.replace(find, replace);
        }
        count
    }

    pub fn contains_in_headers_or_query(&self, needle: &str) -> bool {
        self.headers.iter().any(|(_, v)| v.contains(needle)) || self.query.contains(needle)
    }
}

/// A response as seen by the policy engine.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

// ───────────────────────────── Gate / Route ───────────────────────────────

/// A gate's allow/deny decision. A blocking verdict may customize the
/// HTTP error surfaced to the guest; otherwise `403 text/plain "Blocked by
/// policy"` applies.
#[derive(Debug, Clone, PartialEq)]
pub struct GateVerdict {
    pub allowed: bool,
    pub reason: String,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub body: Option<String>,
}

impl GateVerdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            status_code: None,
            content_type: None,
            body: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            status_code: None,
            content_type: None,
            body: None,
        }
    }

    pub fn deny_with(
        status_code: u16,
        content_type: impl Into<String>,
        body: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            status_code: Some(status_code),
            content_type: Some(content_type.into()),
            body: Some(body.into()),
        }
    }
}

/// A router's instruction to send the request to an alternate backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDirective {
    pub backend_host: String,
    pub backend_port: u16,
    pub use_tls: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RouteDecision {
    pub directive: Option<RouteDirective>,
    pub reason: String,
}

impl RouteDecision {
    pub fn none(reason: impl Into<String>) -> Self {
        Self { directive: None, reason: reason.into() }
    }

    pub fn routed(directive: RouteDirective, reason: impl Into<String>) -> Self {
        Self { directive: Some(directive), reason: reason.into() }
    }
}

/// Outcome of a request/response-transform plugin. `action` is a short
/// tag surfaced in audit events: `"injected"`, `"skipped"`, `"no_op"`,
/// `"logged_usage"`, `"leak_blocked"`.
#[derive(Debug, Clone)]
pub struct RequestDecision {
    pub message: HttpRequest,
    pub action: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ResponseDecision {
    pub message: HttpResponse,
    pub action: String,
    pub reason: String,
}

// ───────────────────────────── Secrets ────────────────────────────────────

/// A secret the guest never sees in cleartext. `placeholder` is the only
/// token the guest holds; `value` must never appear in any emitted event.
#[derive(Debug, Clone)]
pub struct Secret {
    pub value: String,
    pub placeholder: String,
    pub hosts: Vec<String>,
}

/// Render a freshly generated placeholder: 16 random bytes as
/// `SANDBOX_SECRET_<32-hex>`.
pub fn generate_placeholder() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("SANDBOX_SECRET_{}", hex::encode(bytes))
}

// ───────────────────────────── Usage / budget ─────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Openrouter,
    Ollama,
}

/// One line of the usage/cost log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub ts: String,
    pub generation_id: Option<String>,
    pub model: Option<String>,
    pub backend: Backend,
    pub host: String,
    pub path: String,
    pub status_code: u16,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub cost_usd: f64,
    pub cached_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
}

/// Monotonically-increasing USD total, shared between the usage logger
/// (writer) and the budget gate (reader). Stored as bits of an `f64`
/// inside an `AtomicU64` so updates don't require a mutex on the hot gate
/// path.
#[derive(Debug, Default)]
pub struct MonotonicUsd(AtomicU64);

impl MonotonicUsd {
    pub fn new(initial: f64) -> Self {
        Self(AtomicU64::new(initial.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Add `amount` (assumed >= 0) to the running total.
    pub fn add(&self, amount: f64) {
        loop {
            let cur_bits = self.0.load(Ordering::Acquire);
            let cur = f64::from_bits(cur_bits);
            let next = cur + amount;
            if self
                .0
                .compare_exchange(cur_bits, next.to_bits(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetState {
    pub limit_usd: f64,
}

// ───────────────────────────── Audit events ───────────────────────────────

/// One structured audit record. Required fields are always present;
/// `data` is an opaque JSON blob owned by the producing plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: String,
    pub run_id: String,
    pub agent_system: String,
    pub event_type: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub mod event_types {
    pub const HTTP_REQUEST: &str = "http_request";
    pub const HTTP_RESPONSE: &str = "http_response";
    pub const GATE_DECISION: &str = "gate_decision";
    pub const ROUTE_DECISION: &str = "route_decision";
    pub const REQUEST_TRANSFORM: &str = "request_transform";
    pub const RESPONSE_TRANSFORM: &str = "response_transform";
    pub const KEY_INJECTION: &str = "key_injection";
}

// ───────────────────────────── Network hook rules ─────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulePhase {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Block,
    Mutate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BodyReplacement {
    pub find: String,
    pub replace: String,
}

/// Logical shape of a compiled network-hook rule (§3). The interceptor-
/// facing crate wraps the glob fields in a `globset::GlobSet` — this
/// struct carries the declarative intent used to build that matcher.
#[derive(Debug, Clone)]
pub struct CompiledNetworkRule {
    pub phase: RulePhase,
    pub action: RuleAction,
    pub host_globs: Vec<String>,
    pub methods: Vec<String>,
    pub path_glob: Option<String>,
    pub header_sets: HashMap<String, String>,
    pub header_deletes: Vec<String>,
    pub query_sets: HashMap<String, String>,
    pub query_deletes: Vec<String>,
    pub rewrite_path: Option<String>,
    pub response_header_sets: HashMap<String, String>,
    pub response_header_deletes: Vec<String>,
    pub body_replacements: Vec<BodyReplacement>,
    pub callback_id: Option<String>,
    pub timeout_ms: Option<u64>,
}

// ───────────────────────────── Subnet allocation ──────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubnetAllocation {
    pub octet: u8,
    pub vm_id: String,
    pub gateway_ip: String,
    pub guest_ip: String,
    pub cidr: String,
}
