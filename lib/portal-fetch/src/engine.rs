//! Config fetch engine
//!
//! Subscribes to service lifecycle events and, for every (service, config
//! file) pair, runs an independently retryable, cancellable fetch loop.
//! Loop ordering per key is enforced through a monotonic loop-id registry:
//! starting a new loop for a key supersedes the previous one, which then
//! observes itself as stale on its next currency check and exits without
//! side effects.

use crate::backoff;
use crate::config::{ConfigItemSpec, FetchConfig};
use crate::fetcher::{ConfigFetcher, FetchError, FetchRequest};
use crate::validate::ConfigValidator;
use portal_api::{ResourceChange, ServiceRecord};
use portal_core::{ConfigEvent, ConfigEvents, CoreError, MetricsHub, Result, ServiceEvent};
use prometheus::IntGauge;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Last validated payload for one (config name, service) pair
#[derive(Clone, Debug)]
pub struct StoredConfig {
    pub service: ServiceRecord,
    pub meta: Value,
}

struct EngineItem {
    spec: ConfigItemSpec,
    validator: ConfigValidator,
}

struct EngineState {
    /// services currently tracked by this engine
    tracked: HashSet<String>,
    /// config name -> service name -> stored payload
    config_dict: HashMap<String, HashMap<String, StoredConfig>>,
    /// "{service}_{file}" -> current loop id
    loop_registry: HashMap<String, u64>,
    /// "{service}_{file}" -> retries of the active loop
    retry_counters: HashMap<String, u32>,
}

enum Currency {
    Current,
    Superseded,
}

/// Drives the per-service configuration fetch loops.
pub struct ConfigFetchEngine {
    config: FetchConfig,
    items: Vec<EngineItem>,
    state: Arc<Mutex<EngineState>>,
    fetcher: Arc<dyn ConfigFetcher>,
    events: ConfigEvents,
    retry_gauge: Option<IntGauge>,
}

impl ConfigFetchEngine {
    /// Build the engine, compiling every configured schema up front
    pub fn new(
        config: FetchConfig,
        hub: &MetricsHub,
        fetcher: Arc<dyn ConfigFetcher>,
        events: ConfigEvents,
    ) -> Result<Self> {
        let mut items = Vec::new();
        for spec in &config.items {
            let validator = ConfigValidator::compile(spec.schema.as_ref(), &spec.additional_schemas)?;
            items.push(EngineItem {
                spec: spec.clone(),
                validator,
            });
        }

        let retry_gauge = hub.int_gauge(
            "portal_config_fetch_retries",
            "Sum of active config fetch retry counters",
        );

        Ok(Self {
            config,
            items,
            state: Arc::new(Mutex::new(EngineState {
                tracked: HashSet::new(),
                config_dict: HashMap::new(),
                loop_registry: HashMap::new(),
                retry_counters: HashMap::new(),
            })),
            fetcher,
            events,
            retry_gauge,
        })
    }

    pub fn events(&self) -> &ConfigEvents {
        &self.events
    }

    /// Consume service lifecycle events until the channel closes. Adds and
    /// modifications launch fetch loops in their own task so a slow fetch
    /// never delays deletions.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<ServiceEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => match event.change {
                    ResourceChange::Added | ResourceChange::Modified => {
                        let engine = self.clone();
                        tokio::spawn(async move { engine.handle_service(event.service).await });
                    }
                    ResourceChange::Deleted => self.delete_service(&event.service).await,
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Config fetch engine lagged behind {} lifecycle events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Launch (or re-launch) the fetch loops for every configured file of
    /// a service. A schema-validation failure drops the whole service:
    /// malformed configuration is treated like a broken service.
    pub async fn handle_service(&self, service: ServiceRecord) {
        {
            let mut state = self.state.lock().await;
            state.tracked.insert(service.name.clone());
        }

        let loops = self.items.iter().map(|item| self.fetch_loop(&service, item));
        for result in futures::future::join_all(loops).await {
            match result {
                Ok(()) => {}
                Err(CoreError::Validation(message)) => {
                    error!(
                        "Dropping service {} after invalid configuration: {}",
                        service.name, message
                    );
                    self.delete_service(&service).await;
                    return;
                }
                Err(e) => warn!("Config fetch for {} aborted: {}", service.name, e),
            }
        }
    }

    /// Remove all of a service's entries across every config name, cancel
    /// its in-flight loops and counters, and announce the deletion.
    /// Deleting an untracked service is a no-op.
    pub async fn delete_service(&self, service: &ServiceRecord) {
        let was_tracked = {
            let mut state = self.state.lock().await;
            let was_tracked = state.tracked.remove(&service.name);
            for entries in state.config_dict.values_mut() {
                entries.remove(&service.name);
            }
            for item in &self.items {
                let key = config_key(&service.name, &item.spec.config_file_name);
                state.loop_registry.remove(&key);
                state.retry_counters.remove(&key);
            }
            self.sync_retry_gauge(&state);
            was_tracked
        };

        if was_tracked {
            info!("Removed configuration tracking for service {}", service.name);
            self.events.emit(ConfigEvent::Deleted {
                service: service.clone(),
            });
        } else {
            debug!("No configuration tracked for service {}", service.name);
        }
    }

    /// Stored payload for one (config name, service) pair
    pub async fn get_config(&self, config_name: &str, service_name: &str) -> Option<StoredConfig> {
        let state = self.state.lock().await;
        state
            .config_dict
            .get(config_name)
            .and_then(|entries| entries.get(service_name))
            .cloned()
    }

    /// One fetch loop for a (service, config file) pair.
    async fn fetch_loop(&self, service: &ServiceRecord, item: &EngineItem) -> Result<()> {
        let key = config_key(&service.name, &item.spec.config_file_name);

        // admission control: claim the next loop id for this key
        let loop_id = {
            let mut state = self.state.lock().await;
            let next = state.loop_registry.get(&key).copied().unwrap_or(0) + 1;
            if next > self.config.max_loop_id {
                error!("Fetch loop limit reached for {}, abandoning retry chain", key);
                return Err(CoreError::FetchLoopLimit(key));
            }
            state.loop_registry.insert(key.clone(), next);
            next
        };

        let request = FetchRequest {
            service_name: service.name.clone(),
            url: config_url(service, &item.spec.config_file_name),
            headers: HashMap::new(),
        };

        let mut tries: u32 = 0;
        let mut http_tries: u32 = 0;

        loop {
            if let Currency::Superseded = self.currency(&service.name, &key, loop_id).await? {
                debug!("Fetch loop {} for {} superseded, exiting", loop_id, key);
                return Ok(());
            }

            match self.fetcher.fetch_json(&request).await {
                Ok(payload) => {
                    // the network call may have raced a newer update
                    if let Currency::Superseded = self.currency(&service.name, &key, loop_id).await? {
                        debug!("Fetch loop {} for {} superseded mid-flight, discarding result", loop_id, key);
                        return Ok(());
                    }
                    item.validator.validate(&payload)?;
                    self.store(&item.spec, service, payload).await;
                    self.finish_loop(&key, loop_id).await;
                    return Ok(());
                }
                Err(fetch_error) => {
                    if let FetchError::Status(status) = &fetch_error {
                        http_tries += 1;
                        if let Some(limit) = item.spec.limit_of_tries {
                            if http_tries >= limit {
                                warn!(
                                    "Giving up on {} after {} HTTP failures (last status {})",
                                    key, http_tries, status
                                );
                                if item.spec.allow_empty_config || item.spec.config_default.is_some() {
                                    if let Currency::Superseded =
                                        self.currency(&service.name, &key, loop_id).await?
                                    {
                                        return Ok(());
                                    }
                                    let fallback = item
                                        .spec
                                        .config_default
                                        .clone()
                                        .unwrap_or_else(|| Value::Object(Default::default()));
                                    self.store(&item.spec, service, fallback).await;
                                }
                                self.finish_loop(&key, loop_id).await;
                                return Ok(());
                            }
                        }
                    }

                    tries += 1;
                    self.bump_retry_counter(&key, tries).await;
                    let delay = backoff::retry_delay(
                        tries,
                        self.config.retry_period(),
                        self.config.max_retry_period(),
                    );
                    warn!(
                        "Config fetch for {} failed ({}), retrying in {:?} (attempt {})",
                        key, fetch_error, delay, tries
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Whether a loop is still the current one for its key. A removed
    /// service unwinds with an error; a superseded or already-finished key
    /// terminates silently.
    async fn currency(&self, service_name: &str, key: &str, loop_id: u64) -> Result<Currency> {
        let state = self.state.lock().await;
        if !state.tracked.contains(service_name) {
            return Err(CoreError::ServiceRemoved(service_name.to_string()));
        }
        match state.loop_registry.get(key) {
            Some(&current) if current == loop_id => Ok(Currency::Current),
            _ => Ok(Currency::Superseded),
        }
    }

    async fn store(&self, spec: &ConfigItemSpec, service: &ServiceRecord, meta: Value) {
        {
            let mut state = self.state.lock().await;
            state
                .config_dict
                .entry(spec.config_name.clone())
                .or_default()
                .insert(
                    service.name.clone(),
                    StoredConfig {
                        service: service.clone(),
                        meta,
                    },
                );
        }
        info!("Stored {} configuration for service {}", spec.config_name, service.name);
        self.events.emit(ConfigEvent::Updated {
            config_name: spec.config_name.clone(),
            service: service.clone(),
        });
    }

    /// Clear the registry entry and retry counter when this loop is still
    /// the current one, then refresh the retry-sum gauge.
    async fn finish_loop(&self, key: &str, loop_id: u64) {
        let mut state = self.state.lock().await;
        if state.loop_registry.get(key) == Some(&loop_id) {
            state.loop_registry.remove(key);
            state.retry_counters.remove(key);
        }
        self.sync_retry_gauge(&state);
    }

    async fn bump_retry_counter(&self, key: &str, tries: u32) {
        let mut state = self.state.lock().await;
        state.retry_counters.insert(key.to_string(), tries);
        self.sync_retry_gauge(&state);
    }

    fn sync_retry_gauge(&self, state: &EngineState) {
        if let Some(gauge) = &self.retry_gauge {
            gauge.set(state.retry_counters.values().map(|&v| v as i64).sum());
        }
    }
}

fn config_key(service_name: &str, file: &str) -> String {
    format!("{}_{}", service_name, file)
}

/// Where a service's configuration file lives: under the declared UI
/// content context when present, at the service root otherwise.
fn config_url(service: &ServiceRecord, file: &str) -> String {
    let context = service.ui_content_config_context.as_deref().unwrap_or("");
    let context = context.trim_end_matches('/');
    format!("{}://{}{}/{}", service.protocol, service.serviceurl, context, file)
}
