// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  NetGuard — host-side network policy engine for sandboxed guests
//
//  Two listeners: a plain-HTTP interceptor and a TLS-terminating MITM
//  interceptor, both driven through the same policy engine instance.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use netguard_core::config::{AppConfig, NetworkConfig};
use netguard_core::events;
use netguard_core::metrics;
use netguard_interceptor::ca::CertificateAuthority;
use netguard_interceptor::pool::ConnPool;
use netguard_interceptor::{tls, interceptor};
use netguard_observability::EventLogWriter;
use netguard_plugin::engine::Engine;
use netguard_plugin::registry::PluginRegistry;
use netguard_plugins::budget_gate::BudgetGate;
use netguard_plugins::host_filter::{HostFilter, HostFilterConfig};
use netguard_plugins::local_model_router::LocalModelRouter;
use netguard_plugins::network_hooks::NetworkHooks;
use netguard_plugins::secret_injector::SecretInjector;
use netguard_plugins::usage_logger::UsageLogger;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "netguard", version, about = "NetGuard — sandbox network policy engine")]
struct Cli {
    /// Path to configuration file; falls back to netguard.yaml search paths when unset.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG when set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "NetGuard starting");

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default rustls crypto provider"))?;

    let config = AppConfig::load(cli.config.as_deref().and_then(|p| p.to_str()))?;
    std::fs::create_dir_all(&config.cache_dir)?;
    std::fs::create_dir_all(&config.state_dir)?;

    let ca = Arc::new(CertificateAuthority::load_or_create(&config.cache_dir)?);

    let emitter: Arc<dyn events::EventEmitter> =
        Arc::new(EventLogWriter::open(&config.state_dir.join("events.jsonl"))?);

    let metrics: Arc<dyn metrics::RequestMetrics> =
        Arc::new(netguard_observability::metrics::MetricsCollector::default());

    let mut engine = Engine::new(config.node_id.clone(), config.agent_system.clone(), emitter);
    register_builtins(&mut engine, &config.network, &config.state_dir)?;
    register_configured_plugins(&mut engine, &config.network);
    let engine = Arc::new(engine);

    let pool = Arc::new(ConnPool::default());
    Arc::clone(&pool).spawn_sweeper();

    let http_listener = TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "plain-HTTP listener up");
    let http_engine = Arc::clone(&engine);
    let http_pool = Arc::clone(&pool);
    let http_metrics = Arc::clone(&metrics);
    let http_task = tokio::spawn(async move {
        loop {
            let (sock, peer) = match http_listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "plain-HTTP accept failed");
                    continue;
                }
            };
            let engine = Arc::clone(&http_engine);
            let pool = Arc::clone(&http_pool);
            let metrics = Arc::clone(&http_metrics);
            tokio::spawn(async move {
                if let Err(e) = interceptor::handle_connection(sock, peer, engine, pool, metrics).await {
                    warn!(error = %e, %peer, "plain-HTTP connection ended with error");
                }
            });
        }
    });

    let acceptor = tls::build_acceptor(Arc::clone(&ca));
    let connector = tls::build_connector();
    let https_listener = TcpListener::bind(config.https_addr).await?;
    info!(addr = %config.https_addr, "TLS listener up");
    let https_engine = Arc::clone(&engine);
    let https_metrics = Arc::clone(&metrics);
    let https_task = tokio::spawn(async move {
        loop {
            let (sock, peer) = match https_listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "TLS accept failed");
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let connector = connector.clone();
            let engine = Arc::clone(&https_engine);
            let metrics = Arc::clone(&https_metrics);
            tokio::spawn(async move {
                if let Err(e) = tls::handle_connection(sock, peer, acceptor, connector, engine, metrics).await {
                    warn!(error = %e, %peer, "TLS connection ended with error");
                }
            });
        }
    });

    info!("NetGuard is ready — serving traffic");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    info!("shutting down");
    http_task.abort();
    https_task.abort();
    Ok(())
}

/// Build the built-ins that compile straight from flat `NetworkConfig`
/// fields rather than going through the registry's `plugins:` list.
fn register_builtins(engine: &mut Engine, network: &NetworkConfig, state_dir: &std::path::Path) -> anyhow::Result<()> {
    let host_filter = HostFilter::new(HostFilterConfig {
        allowed_hosts: network.allowed_hosts.clone(),
        block_private_ips: network.block_private_ips,
        allowed_private_hosts: network.allowed_private_hosts.clone(),
    });
    engine.register_bundle(netguard_plugin::registry::PluginBundle {
        gate: Some(Arc::new(host_filter)),
        ..Default::default()
    });

    if !network.secrets.is_empty() {
        let injector = SecretInjector::new(network.secrets.clone());
        let injector = Arc::new(injector);
        engine.register_bundle(netguard_plugin::registry::PluginBundle {
            request: Some(Arc::clone(&injector) as _),
            placeholder_provider: Some(injector as _),
            ..Default::default()
        });
    }

    if !network.local_model_routing.is_empty() {
        let router = LocalModelRouter::new(network.local_model_routing.clone());
        engine.register_bundle(netguard_plugin::registry::PluginBundle {
            route: Some(Arc::new(router)),
            ..Default::default()
        });
    }

    if !network.interception.rules.is_empty() {
        let hooks = NetworkHooks::new(network.interception.rules.clone(), network.interception.callback_socket.clone())?;
        let hooks = Arc::new(hooks);
        engine.register_bundle(netguard_plugin::registry::PluginBundle {
            request: Some(Arc::clone(&hooks) as _),
            response: Some(hooks as _),
            ..Default::default()
        });
    }

    let usage_log_path = network
        .usage_log_path
        .clone()
        .unwrap_or_else(|| state_dir.join("usage.jsonl"));
    let (usage_logger, total_cost) = UsageLogger::open(&usage_log_path)?;
    engine.register_bundle(netguard_plugin::registry::PluginBundle {
        response: Some(Arc::new(usage_logger)),
        ..Default::default()
    });

    if let Some(limit) = network.budget_limit_usd {
        let budget_gate = BudgetGate::new(total_cost, limit);
        engine.register_bundle(netguard_plugin::registry::PluginBundle {
            gate: Some(Arc::new(budget_gate)),
            ..Default::default()
        });
    }

    Ok(())
}

/// Build the registry-resolved plugins named in `network.plugins`. Unknown
/// types and factory failures are logged and skipped — one bad entry
/// never aborts startup.
fn register_configured_plugins(engine: &mut Engine, network: &NetworkConfig) {
    let mut registry = PluginRegistry::new();
    netguard_plugins::register_all(&mut registry);

    for entry in &network.plugins {
        if !entry.enabled {
            continue;
        }
        match registry.build(&entry.plugin_type, &entry.config) {
            Some(Ok(bundle)) => {
                info!(plugin = %entry.plugin_type, "plugin registered");
                engine.register_bundle(bundle);
            }
            Some(Err(e)) => {
                warn!(plugin = %entry.plugin_type, error = %e, "plugin failed to build, skipping");
            }
            None => {
                error!(plugin = %entry.plugin_type, "unknown plugin type in configuration, skipping");
            }
        }
    }
}
