//! Host allow-list and private-IP gate. Config shape
//! and "deny with a JSON body" style are grounded on
//! `ip_restriction.rs`'s allowlist/denylist plugin; this gate adds the
//! private-IP special case and a mutable allow list instead.

use netguard_core::glob::{host_matches_any, is_private_host_literal, normalize_host};
use netguard_core::types::GateVerdict;
use netguard_core::EngineError;
use netguard_plugin::plugin::{GatePlugin, PluginContext};
use serde::Deserialize;
use std::sync::RwLock;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostFilterConfig {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub block_private_ips: bool,
    #[serde(default)]
    pub allowed_private_hosts: Vec<String>,
}

/// The allow list is the only mutable piece — `block_private_ips` and
/// `allowed_private_hosts` are fixed at construction.
pub struct HostFilter {
    allowed_hosts: RwLock<Vec<String>>,
    block_private_ips: bool,
    allowed_private_hosts: Vec<String>,
}

impl HostFilter {
    pub fn new(config: HostFilterConfig) -> Self {
        Self {
            allowed_hosts: RwLock::new(config.allowed_hosts),
            block_private_ips: config.block_private_ips,
            allowed_private_hosts: config.allowed_private_hosts,
        }
    }

    pub fn from_value(config: &serde_json::Value) -> Result<Self, EngineError> {
        let cfg: HostFilterConfig = serde_json::from_value(config.clone()).map_err(|e| {
            EngineError::InvalidPluginConfig { plugin: "host-filter".into(), reason: e.to_string() }
        })?;
        Ok(Self::new(cfg))
    }

    pub fn add(&self, host: impl Into<String>) {
        let mut hosts = self.allowed_hosts.write().unwrap_or_else(|e| e.into_inner());
        hosts.push(host.into());
    }

    pub fn remove(&self, host: &str) {
        let mut hosts = self.allowed_hosts.write().unwrap_or_else(|e| e.into_inner());
        hosts.retain(|h| h != host);
    }

    pub fn list(&self) -> Vec<String> {
        self.allowed_hosts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl GatePlugin for HostFilter {
    fn name(&self) -> &str {
        "host-filter"
    }

    fn gate(&self, host: &str, _ctx: &mut PluginContext) -> GateVerdict {
        let host = normalize_host(host);

        if self.block_private_ips
            && is_private_host_literal(&host)
            && !host_matches_any(&host, &self.allowed_private_hosts)
        {
            return GateVerdict::deny(format!("{host} is a private IP literal"));
        }

        let allowed_hosts = self.allowed_hosts.read().unwrap_or_else(|e| e.into_inner());
        if allowed_hosts.is_empty() || host_matches_any(&host, &allowed_hosts) {
            GateVerdict::allow(format!("{host} matches allow list"))
        } else {
            GateVerdict::deny(format!("{host} matches no allowed_hosts pattern"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PluginContext {
        PluginContext::new("1.2.3.4")
    }

    #[test]
    fn empty_allow_list_permits_any_public_host() {
        let filter = HostFilter::new(HostFilterConfig::default());
        assert!(filter.gate("api.example.com", &mut ctx()).allowed);
    }

    #[test]
    fn nonempty_allow_list_requires_glob_match() {
        let filter = HostFilter::new(HostFilterConfig {
            allowed_hosts: vec!["*.example.com".into()],
            ..Default::default()
        });
        assert!(filter.gate("api.example.com", &mut ctx()).allowed);
        assert!(!filter.gate("evil.com", &mut ctx()).allowed);
    }

    #[test]
    fn private_ip_blocked_when_flag_set() {
        let filter = HostFilter::new(HostFilterConfig {
            block_private_ips: true,
            ..Default::default()
        });
        assert!(!filter.gate("10.0.0.5", &mut ctx()).allowed);
        assert!(filter.gate("8.8.8.8", &mut ctx()).allowed);
    }

    #[test]
    fn allowed_private_hosts_overrides_block() {
        let filter = HostFilter::new(HostFilterConfig {
            block_private_ips: true,
            allowed_private_hosts: vec!["10.0.0.5".into()],
            ..Default::default()
        });
        assert!(filter.gate("10.0.0.5", &mut ctx()).allowed);
        assert!(!filter.gate("10.0.0.6", &mut ctx()).allowed);
    }

    #[test]
    fn host_header_port_is_stripped_before_matching() {
        let filter = HostFilter::new(HostFilterConfig {
            allowed_hosts: vec!["api.example.com".into()],
            ..Default::default()
        });
        assert!(filter.gate("api.example.com:8443", &mut ctx()).allowed);
    }

    #[test]
    fn imperative_add_remove_list() {
        let filter = HostFilter::new(HostFilterConfig {
            allowed_hosts: vec!["a.com".into()],
            ..Default::default()
        });
        filter.add("b.com");
        assert_eq!(filter.list(), vec!["a.com".to_string(), "b.com".to_string()]);
        assert!(filter.gate("b.com", &mut ctx()).allowed);
        filter.remove("a.com");
        assert!(!filter.gate("a.com", &mut ctx()).allowed);
    }

    #[test]
    fn two_gates_and_together_only_the_shared_host_survives() {
        use netguard_plugin::engine::Engine;
        use netguard_plugin::registry::PluginBundle;
        use std::sync::Arc;

        let flat = HostFilter::new(HostFilterConfig {
            allowed_hosts: vec!["shared.com".into(), "flat-only.com".into()],
            ..Default::default()
        });
        let from_plugins_list = HostFilter::new(HostFilterConfig {
            allowed_hosts: vec!["shared.com".into(), "plugin-only.com".into()],
            ..Default::default()
        });

        let mut engine = Engine::new("r", "sandbox", netguard_core::events::noop());
        engine.register_bundle(PluginBundle { gate: Some(Arc::new(flat)), ..Default::default() });
        engine.register_bundle(PluginBundle { gate: Some(Arc::new(from_plugins_list)), ..Default::default() });

        assert!(engine.gate("shared.com", &mut ctx()).allowed);
        assert!(!engine.gate("flat-only.com", &mut ctx()).allowed);
        assert!(!engine.gate("plugin-only.com", &mut ctx()).allowed);
        assert!(!engine.gate("neither.com", &mut ctx()).allowed);
    }
}
