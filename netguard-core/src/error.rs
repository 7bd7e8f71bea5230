use crate::types::GateVerdict;
use thiserror::Error;

/// Unified error taxonomy for the policy engine and its interceptor.
///
/// Every variant maps to an HTTP status the guest will observe — the
/// policy decision is surfaced to the guest exclusively through the
/// response, there is no out-of-band signalling channel.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A gate denied the host. Carries the verdict so a custom
    /// status/content-type/body set by the gate survives to the wire.
    #[error("host blocked: {0}")]
    HostBlocked(HostBlockedDetail),

    /// A secret's placeholder reached a host not listed in its `hosts`.
    #[error("secret leak to host {host}")]
    SecretLeak { host: String },

    /// A network-hook rule with `action=block` matched.
    #[error("blocked by rule: {reason}")]
    RuleBlocked { reason: String },

    #[error("upstream dial failed: {0}")]
    UpstreamDial(String),

    #[error("upstream write failed: {0}")]
    UpstreamWrite(String),

    #[error("upstream read failed: {0}")]
    UpstreamRead(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid plugin config for {plugin}: {reason}")]
    InvalidPluginConfig { plugin: String, reason: String },

    /// SDK callback failed or timed out. Per design, this is fail-open:
    /// the rule is treated as failed and the request proceeds unmutated.
    /// The variant exists so callers can log it; it is not meant to be
    /// converted into an HTTP response.
    #[error("callback error: {0}")]
    CallbackError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Wraps a [`GateVerdict`] so it can travel inside [`EngineError`] while
/// still implementing the traits `thiserror` needs (`Display`, `Debug`).
#[derive(Debug, Clone)]
pub struct HostBlockedDetail(pub GateVerdict);

impl std::fmt::Display for HostBlockedDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.reason)
    }
}

impl EngineError {
    pub fn host_blocked(verdict: GateVerdict) -> Self {
        EngineError::HostBlocked(HostBlockedDetail(verdict))
    }

    /// Map to the HTTP status code the guest should observe.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::HostBlocked(d) => d.0.status_code.unwrap_or(403),
            EngineError::SecretLeak { .. } => 403,
            EngineError::RuleBlocked { .. } => 403,
            EngineError::UpstreamDial(_) => 502,
            EngineError::UpstreamWrite(_) => 502,
            EngineError::UpstreamRead(_) => 502,
            EngineError::InvalidConfig(_) => 500,
            EngineError::InvalidPluginConfig { .. } => 500,
            EngineError::CallbackError(_) => 502,
            EngineError::Io(_) => 502,
            EngineError::Serde(_) => 500,
        }
    }

    /// Content-Type the response body should carry.
    pub fn content_type(&self) -> &str {
        match self {
            EngineError::HostBlocked(d) => {
                d.0.content_type.as_deref().unwrap_or("text/plain")
            }
            EngineError::SecretLeak { .. } | EngineError::RuleBlocked { .. } => "text/plain",
            _ => "application/json",
        }
    }

    /// The response body the guest should receive.
    pub fn body(&self) -> Vec<u8> {
        match self {
            EngineError::HostBlocked(d) => d
                .0
                .body
                .clone()
                .unwrap_or_else(|| "Blocked by policy".to_string())
                .into_bytes(),
            EngineError::SecretLeak { .. } | EngineError::RuleBlocked { .. } => {
                b"Blocked by policy".to_vec()
            }
            other => format!(r#"{{"error":"{}","status":{}}}"#, other, other.status_code())
                .into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GateVerdict;

    #[test]
    fn default_host_blocked_is_403_text_plain() {
        let err = EngineError::host_blocked(GateVerdict::deny("no match"));
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.content_type(), "text/plain");
        assert_eq!(err.body(), b"Blocked by policy");
    }

    #[test]
    fn custom_verdict_overrides_survive() {
        let verdict = GateVerdict::deny_with(
            429,
            "application/json",
            r#"{"error":{"message":"budget"}}"#,
            "budget exceeded",
        );
        let err = EngineError::host_blocked(verdict);
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.content_type(), "application/json");
        assert!(String::from_utf8(err.body()).unwrap().contains("budget"));
    }

    #[test]
    fn secret_leak_is_403() {
        let err = EngineError::SecretLeak { host: "evil.com".into() };
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.body(), b"Blocked by policy");
    }

    #[test]
    fn upstream_errors_are_502() {
        assert_eq!(EngineError::UpstreamDial("x".into()).status_code(), 502);
        assert_eq!(EngineError::UpstreamWrite("x".into()).status_code(), 502);
        assert_eq!(EngineError::UpstreamRead("x".into()).status_code(), 502);
    }

    #[test]
    fn invalid_plugin_config_json_body() {
        let err = EngineError::InvalidPluginConfig {
            plugin: "host-filter".into(),
            reason: "bad glob".into(),
        };
        let body = String::from_utf8(err.body()).unwrap();
        assert!(body.contains("500"));
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["status"], 500);
    }
}
