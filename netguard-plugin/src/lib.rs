pub mod engine;
pub mod plugin;
pub mod registry;

pub use engine::Engine;
pub use plugin::{GatePlugin, PlaceholderProvider, PluginContext, RequestPlugin, ResponsePlugin, RoutePlugin};
pub use registry::{PluginBundle, PluginRegistry};
