use anyhow::{Context, Result};
use portal_core::{
    ConfigEvents, LogFaultIndicator, ManualServiceConfigHandler, MetricsHub, ServiceCollection,
    ServiceEvent, ServiceEvents,
};
use portal_fetch::{ConfigFetchEngine, FetchConfig, HttpConfigFetcher};
use portal_k8s::{ClusterWatcher, DiscoveryConfig, KubeClusterReader};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::init as tracing_init;

/// Agent configuration: discovery and fetch settings plus the statically
/// configured services.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AgentConfig {
    metrics_enabled: bool,
    discovery: DiscoveryConfig,
    fetch: FetchConfig,
    /// Raw manual service list; validated by the manual config handler
    manual_services: Option<Value>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            discovery: DiscoveryConfig::default(),
            fetch: FetchConfig::default(),
            manual_services: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting portal-agent...");

    let config = load_config()?;

    let hub = MetricsHub::new(config.metrics_enabled);
    let collection = Arc::new(ServiceCollection::new(ServiceEvents::new()));
    info!("Service collection initialized");

    // both sources feed the collection, which emits the aggregated stream
    let manual_events = ServiceEvents::new();
    let manual = Arc::new(ManualServiceConfigHandler::new(manual_events.clone()));
    spawn_bridge(manual_events.subscribe(), collection.clone());

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let namespace = config.discovery.resolve_namespace();
    let reader = Arc::new(KubeClusterReader::new(client.clone(), &namespace));
    let watcher_events = ServiceEvents::new();
    let watcher = Arc::new(ClusterWatcher::new(
        config.discovery.clone(),
        &hub,
        reader,
        Arc::new(LogFaultIndicator),
        watcher_events.clone(),
    ));
    spawn_bridge(watcher_events.subscribe(), collection.clone());
    info!("Cluster watcher initialized for namespace {}", namespace);

    let engine = Arc::new(ConfigFetchEngine::new(
        config.fetch.clone(),
        &hub,
        Arc::new(HttpConfigFetcher::new()),
        ConfigEvents::new(),
    )?);
    tokio::spawn(engine.clone().run(collection.events().subscribe()));
    info!("Config fetch engine initialized with {} config items", config.fetch.items.len());

    let _watch_handles = watcher.spawn_watches(client);
    info!("Cluster watches established");

    if let Some(manual_list) = config.manual_services.clone() {
        manual.handle_service_config_change(manual_list).await;
    }

    // Periodic registry logging
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;

        let count = collection.service_count().await;
        info!("Service registry has {} services", count);

        if hub.is_enabled() {
            match hub.gather() {
                Ok(text) => debug!("Metrics:\n{}", text),
                Err(e) => warn!("Failed to gather metrics: {}", e),
            }
        }
    }
}

/// Forward a source's lifecycle events into the collection
fn spawn_bridge(mut rx: broadcast::Receiver<ServiceEvent>, collection: Arc<ServiceCollection>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => collection.apply(event.change, event.service).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Lifecycle bridge lagged behind {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Load the agent configuration from the file named by PORTAL_CONFIG,
/// falling back to built-in defaults when unset.
fn load_config() -> Result<AgentConfig> {
    match std::env::var("PORTAL_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read configuration at {}", path))?;
            let config = serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid configuration in {}", path))?;
            info!("Configuration loaded from {}", path);
            Ok(config)
        }
        Err(_) => {
            warn!("PORTAL_CONFIG not set, using built-in defaults");
            Ok(AgentConfig::default())
        }
    }
}
