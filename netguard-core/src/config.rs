//! Layered configuration: a YAML file merged with `NETGUARD_`-prefixed
//! environment overrides via `figment`.

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine instance ID (auto-generated if not set); surfaced on every
    /// emitted event as `run_id` unless the caller overrides it.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Agent-system label attached to every emitted event.
    #[serde(default = "default_agent_system")]
    pub agent_system: String,

    /// Plain-HTTP listener address.
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// TLS listener address (MITM path).
    #[serde(default = "default_https_addr")]
    pub https_addr: SocketAddr,

    /// Directory holding `mitm/ca.crt` + `mitm/ca.key`.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Directory holding `subnets/<vm_id>.json` and other runtime state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// Declarative network policy input. JSON on the wire; loaded here as
/// part of the same layered config for convenience, but logically owned
/// by the guest-facing SDK.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub block_private_ips: bool,
    #[serde(default)]
    pub allowed_private_hosts: Vec<String>,
    #[serde(default)]
    pub add_hosts: Vec<AddHost>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub secrets: HashMap<String, SecretConfig>,
    #[serde(default)]
    pub local_model_routing: Vec<LocalModelRoute>,
    #[serde(default)]
    pub usage_log_path: Option<PathBuf>,
    #[serde(default)]
    pub budget_limit_usd: Option<f64>,
    #[serde(default)]
    pub interception: InterceptionConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfigEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddHost {
    pub host: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretConfig {
    pub value: String,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalModelRoute {
    pub source_host: String,
    #[serde(default = "default_chat_completions_path")]
    pub path: String,
    pub backend_host: String,
    pub backend_port: u16,
    #[serde(default)]
    pub models: HashMap<String, ModelTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTarget {
    pub target: String,
    #[serde(default)]
    pub backend_host: Option<String>,
    #[serde(default)]
    pub backend_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptionConfig {
    #[serde(default)]
    pub rules: Vec<NetworkHookRuleConfig>,
    #[serde(default)]
    pub callback_socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkHookRuleConfig {
    pub phase: String,
    pub action: String,
    #[serde(default)]
    pub host_globs: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub path_glob: Option<String>,
    #[serde(default)]
    pub header_sets: HashMap<String, String>,
    #[serde(default)]
    pub header_deletes: Vec<String>,
    #[serde(default)]
    pub query_sets: HashMap<String, String>,
    #[serde(default)]
    pub query_deletes: Vec<String>,
    #[serde(default)]
    pub rewrite_path: Option<String>,
    #[serde(default)]
    pub response_header_sets: HashMap<String, String>,
    #[serde(default)]
    pub response_header_deletes: Vec<String>,
    #[serde(default)]
    pub body_replacements: Vec<BodyReplacementConfig>,
    #[serde(default)]
    pub callback_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyReplacementConfig {
    pub find: String,
    pub replace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfigEntry {
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "serde_json::Value::default")]
    pub config: serde_json::Value,
}

impl AppConfig {
    /// Load configuration from YAML file + environment variables.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["netguard.yaml", "/etc/netguard/netguard.yaml", "config/netguard.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        // NETGUARD_NETWORK__BUDGET_LIMIT_USD, etc.
        figment = figment.merge(Env::prefixed("NETGUARD_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            agent_system: default_agent_system(),
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            cache_dir: default_cache_dir(),
            state_dir: default_state_dir(),
            log_level: default_log_level(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self { rules: vec![], callback_socket: None }
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_agent_system() -> String {
    "sandbox".to_string()
}

fn default_http_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_https_addr() -> SocketAddr {
    "0.0.0.0:8443".parse().unwrap()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/netguard")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/netguard")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_chat_completions_path() -> String {
    "/api/v1/chat/completions".to_string()
}

fn default_true() -> bool {
    true
}
