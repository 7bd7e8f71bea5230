//! Name → factory map. Grounded directly on `ando-plugin::registry::
//! PluginRegistry`'s register/get/list shape, generalized so one factory
//! can hand back any combination of the five phase traits at once.

use crate::plugin::{GatePlugin, PlaceholderProvider, RequestPlugin, ResponsePlugin, RoutePlugin};
use netguard_core::EngineError;
use std::collections::HashMap;
use std::sync::Arc;

/// What a single plugin instance contributes to the pipeline. Any
/// combination of fields may be populated — a plugin need not implement
/// every trait.
#[derive(Default)]
pub struct PluginBundle {
    pub gate: Option<Arc<dyn GatePlugin>>,
    pub route: Option<Arc<dyn RoutePlugin>>,
    pub request: Option<Arc<dyn RequestPlugin>>,
    pub response: Option<Arc<dyn ResponsePlugin>>,
    pub placeholder_provider: Option<Arc<dyn PlaceholderProvider>>,
}

type Factory = Box<dyn Fn(&serde_json::Value) -> Result<PluginBundle, EngineError> + Send + Sync>;

/// Process-wide, init-once, read-many registry of plugin factories.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, Factory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        factory: impl Fn(&serde_json::Value) -> Result<PluginBundle, EngineError> + Send + Sync + 'static,
    ) {
        self.factories.insert(type_name.into(), Box::new(factory));
    }

    pub fn build(&self, type_name: &str, config: &serde_json::Value) -> Option<Result<PluginBundle, EngineError>> {
        self.factories.get(type_name).map(|f| f(config))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_build() {
        let mut registry = PluginRegistry::new();
        registry.register("noop", |_cfg| Ok(PluginBundle::default()));
        assert!(registry.contains("noop"));
        assert_eq!(registry.len(), 1);
        let bundle = registry.build("noop", &serde_json::json!({})).unwrap().unwrap();
        assert!(bundle.gate.is_none());
    }

    #[test]
    fn unknown_type_returns_none() {
        let registry = PluginRegistry::new();
        assert!(registry.build("does-not-exist", &serde_json::json!({})).is_none());
    }

    #[test]
    fn factory_error_propagates() {
        let mut registry = PluginRegistry::new();
        registry.register("broken", |_cfg| {
            Err(EngineError::InvalidPluginConfig {
                plugin: "broken".into(),
                reason: "always fails".into(),
            })
        });
        let result = registry.build("broken", &serde_json::json!({})).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn empty_registry_reports_empty() {
        let registry = PluginRegistry::new();
        assert!(registry.is_empty());
    }
}
