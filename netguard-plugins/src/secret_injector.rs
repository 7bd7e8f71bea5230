//! Secret placeholder injection and leak detection.
//! Style — a config struct describing a credential plus a runtime table
//! checked per request — is grounded on `key_auth.rs`'s API-key handling,
//! inverted: instead of validating an inbound key, this plugin injects an
//! outbound one and refuses to let it travel anywhere unlisted.

use netguard_core::config::SecretConfig;
use netguard_core::glob::host_matches_any;
use netguard_core::types::{generate_placeholder, HttpRequest, RequestDecision, Secret};
use netguard_core::EngineError;
use netguard_plugin::plugin::{PlaceholderProvider, PluginContext, RequestPlugin};
use std::collections::HashMap;

pub struct SecretInjector {
    secrets: Vec<(String, Secret)>,
}

impl SecretInjector {
    pub fn new(config: HashMap<String, SecretConfig>) -> Self {
        let secrets = config
            .into_iter()
            .map(|(name, cfg)| {
                let placeholder = cfg.placeholder.unwrap_or_else(generate_placeholder);
                (name, Secret { value: cfg.value, placeholder, hosts: cfg.hosts })
            })
            .collect();
        Self { secrets }
    }

    pub fn from_value(config: &serde_json::Value) -> Result<Self, EngineError> {
        let cfg: HashMap<String, SecretConfig> = serde_json::from_value(config.clone())
            .map_err(|e| EngineError::InvalidPluginConfig { plugin: "secret-injector".into(), reason: e.to_string() })?;
        Ok(Self::new(cfg))
    }

    fn host_allowed(secret: &Secret, host: &str) -> bool {
        secret.hosts.is_empty() || host_matches_any(host, &secret.hosts)
    }
}

impl RequestPlugin for SecretInjector {
    fn name(&self) -> &str {
        "secret-injector"
    }

    fn on_request(
        &self,
        mut req: HttpRequest,
        host: &str,
        _ctx: &mut PluginContext,
    ) -> Result<RequestDecision, EngineError> {
        let mut injected_any = false;
        for (_, secret) in &self.secrets {
            if Self::host_allowed(secret, host) {
                let replaced = req.replace_in_headers_and_query(&secret.placeholder, &secret.value);
                if replaced > 0 {
                    injected_any = true;
                }
            } else if req.contains_in_headers_or_query(&secret.placeholder) {
                return Err(EngineError::SecretLeak { host: host.to_string() });
            }
        }

        let action = if injected_any { "injected" } else { "skipped" };
        Ok(RequestDecision { message: req, action: action.into(), reason: format!("secret scan on {host}") })
    }
}

impl PlaceholderProvider for SecretInjector {
    fn name(&self) -> &str {
        "secret-injector"
    }

    fn placeholders(&self) -> HashMap<String, String> {
        self.secrets.iter().map(|(name, s)| (name.clone(), s.placeholder.clone())).collect()
    }
}
