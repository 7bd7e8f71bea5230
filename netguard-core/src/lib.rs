pub mod config;
pub mod error;
pub mod events;
pub mod glob;
pub mod metrics;
pub mod ssl;
pub mod types;

pub use config::{AppConfig, NetworkConfig};
pub use error::EngineError;
