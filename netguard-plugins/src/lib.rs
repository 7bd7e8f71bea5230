//! Built-in plugins, registered by type name into a
//! [`PluginRegistry`]. `usage-logger` and `budget-gate` are deliberately
//! not registered here — they share an `Arc<MonotonicUsd>` that only the
//! server's wiring code can hand to both at construction time, so
//! `netguard-server` builds and registers that pair directly.

pub mod budget_gate;
pub mod host_filter;
pub mod local_model_router;
pub mod network_hooks;
pub mod secret_injector;
pub mod usage_logger;

use host_filter::HostFilter;
use local_model_router::LocalModelRouter;
use netguard_core::config::LocalModelRoute;
use network_hooks::NetworkHooks;
use netguard_plugin::registry::{PluginBundle, PluginRegistry};
use secret_injector::SecretInjector;
use std::sync::Arc;

/// Register the stateless built-ins that can be fully constructed from a
/// single JSON config blob.
pub fn register_all(registry: &mut PluginRegistry) {
    registry.register("host-filter", |cfg| {
        Ok(PluginBundle { gate: Some(Arc::new(HostFilter::from_value(cfg)?)), ..Default::default() })
    });

    registry.register("secret-injector", |cfg| {
        let plugin = Arc::new(SecretInjector::from_value(cfg)?);
        Ok(PluginBundle { request: Some(plugin.clone()), placeholder_provider: Some(plugin), ..Default::default() })
    });

    registry.register("local-model-router", |cfg| {
        let routes: Vec<LocalModelRoute> = serde_json::from_value(cfg.clone()).map_err(|e| {
            netguard_core::EngineError::InvalidPluginConfig { plugin: "local-model-router".into(), reason: e.to_string() }
        })?;
        Ok(PluginBundle { route: Some(Arc::new(LocalModelRouter::new(routes))), ..Default::default() })
    });

    registry.register("network-hooks", |cfg| {
        let plugin = Arc::new(NetworkHooks::from_value(cfg)?);
        Ok(PluginBundle { request: Some(plugin.clone()), response: Some(plugin), ..Default::default() })
    });
}
