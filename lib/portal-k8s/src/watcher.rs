//! Cluster watcher
//!
//! Watches Service, Pod and Endpoints resources in one namespace and
//! reconciles them into logical "service with base URL" records. Readiness
//! is derived by cross-referencing the three kinds: a service is announced
//! only once its endpoint set is populated, and deregistered when its
//! endpoints dry up or its discovery label disappears.

use crate::cluster::ClusterReader;
use crate::config::DiscoveryConfig;
use crate::ingress::{ingress_base_url, ingress_targets};
use crate::metric::{K8sResourceMetric, RESOURCE_ENDPOINT, RESOURCE_POD, RESOURCE_SERVICE};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::api::{Api, WatchEvent, WatchParams};
use kube::Client;
use portal_api::{ResourceChange, ServiceRecord};
use portal_core::{CoreError, FaultIndicator, MetricsHub, Result, ServiceEvents};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct WatcherState {
    /// service name -> label selector; an entry marks a tracked service
    selectors: HashMap<String, BTreeMap<String, String>>,
    /// service name -> pod IPs, replaced wholesale per Endpoints event
    endpoints: HashMap<String, Vec<String>>,
    service_metric: K8sResourceMetric,
    pod_metric: K8sResourceMetric,
    endpoint_metric: K8sResourceMetric,
}

/// Watches the cluster and emits service lifecycle events.
pub struct ClusterWatcher {
    config: DiscoveryConfig,
    namespace: String,
    state: Arc<Mutex<WatcherState>>,
    reader: Arc<dyn ClusterReader>,
    fault: Arc<dyn FaultIndicator>,
    events: ServiceEvents,
}

impl ClusterWatcher {
    /// Build a watcher and wire the service-metric removal cascade: when a
    /// Service entry is removed, all pod entries it owns are dropped too.
    pub fn new(
        config: DiscoveryConfig,
        hub: &MetricsHub,
        reader: Arc<dyn ClusterReader>,
        fault: Arc<dyn FaultIndicator>,
        events: ServiceEvents,
    ) -> Self {
        let namespace = config.resolve_namespace();

        let mut service_metric = K8sResourceMetric::new(hub, RESOURCE_SERVICE);
        let pod_metric = K8sResourceMetric::new(hub, RESOURCE_POD);
        let endpoint_metric = K8sResourceMetric::new(hub, RESOURCE_ENDPOINT);

        let (removed_tx, mut removed_rx) = mpsc::unbounded_channel();
        service_metric.on_remove(removed_tx);

        let state = Arc::new(Mutex::new(WatcherState {
            selectors: HashMap::new(),
            endpoints: HashMap::new(),
            service_metric,
            pod_metric,
            endpoint_metric,
        }));

        let cascade = state.clone();
        tokio::spawn(async move {
            while let Some(name) = removed_rx.recv().await {
                let mut state = cascade.lock().await;
                state.pod_metric.remove_by_service_name(&name);
            }
        });

        Self {
            config,
            namespace,
            state,
            reader,
            fault,
            events,
        }
    }

    pub fn events(&self) -> &ServiceEvents {
        &self.events
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Open the three watch streams in Service -> Endpoints -> Pod order.
    /// Each stream reconnects forever; the returned handles never resolve
    /// in normal operation.
    pub fn spawn_watches(self: &Arc<Self>, client: Client) -> Vec<JoinHandle<()>> {
        let services: Api<Service> = Api::namespaced(client.clone(), &self.namespace);
        let endpoints: Api<Endpoints> = Api::namespaced(client.clone(), &self.namespace);
        let pods: Api<Pod> = Api::namespaced(client, &self.namespace);

        vec![
            tokio::spawn(watch_services(self.clone(), services)),
            tokio::spawn(watch_endpoints(self.clone(), endpoints)),
            tokio::spawn(watch_pods(self.clone(), pods)),
        ]
    }

    /// Handle one Service watch event.
    pub async fn handle_service_event(&self, change: ResourceChange, svc: &Service) -> Result<()> {
        let name = match &svc.metadata.name {
            Some(name) => name.clone(),
            None => return Ok(()),
        };

        if change == ResourceChange::Deleted {
            return self.deregister_service(&name, svc).await;
        }

        if !self.is_relevant(svc) {
            let was_tracked = self.state.lock().await.selectors.contains_key(&name);
            if was_tracked {
                info!("Service {} lost the discovery label, deregistering", name);
                return self.deregister_service(&name, svc).await;
            }
            debug!("Ignoring service without discovery label: {}", name);
            return Ok(());
        }

        let port = match self.service_port(svc) {
            Some(port) => port,
            None => {
                warn!("Service {} declares no container port, skipping", name);
                return Ok(());
            }
        };

        // an untracked service is an add no matter what the watch event
        // claimed (self-healing re-registration); a tracked one is a
        // modification even when the stream replays ADDED after a re-watch
        let effective = {
            let mut state = self.state.lock().await;
            let tracked = state.selectors.contains_key(&name);
            let selector = svc
                .spec
                .as_ref()
                .and_then(|spec| spec.selector.clone())
                .unwrap_or_default();
            state.selectors.insert(name.clone(), selector);
            if tracked { ResourceChange::Modified } else { ResourceChange::Added }
        };

        self.wait_for_pod_startup(&name).await?;

        let record = self.build_record(svc, Some(port)).await;
        {
            let mut state = self.state.lock().await;
            state.service_metric.update(ResourceChange::Added, &name, &name);
        }
        info!("Service {} reconciled as {} ({})", name, effective, record.serviceurl);
        self.events.emit(effective, record);
        Ok(())
    }

    /// Drop a service from tracking and announce the removal. A service
    /// that was never tracked is cleaned up silently so consumers never
    /// see a `Deleted` without a preceding `Added`.
    async fn deregister_service(&self, name: &str, svc: &Service) -> Result<()> {
        let was_tracked = {
            let mut state = self.state.lock().await;
            let was_tracked = state.selectors.remove(name).is_some();
            state.service_metric.update(ResourceChange::Deleted, name, name);
            was_tracked
        };
        if !was_tracked {
            debug!("Service {} deleted but was never tracked", name);
            return Ok(());
        }

        // resolve the base URL one last time so the final event carries it
        let record = self.build_record(svc, self.service_port(svc)).await;
        info!("Service {} deregistered", name);
        self.events.emit(ResourceChange::Deleted, record);
        Ok(())
    }

    /// Handle one Endpoints watch event. The endpoint map entry is replaced
    /// wholesale, then the pod metric is rebuilt from the entire map so
    /// shared addresses are never double-counted.
    pub async fn handle_endpoint_event(&self, change: ResourceChange, ep: &Endpoints) -> Result<()> {
        let name = match &ep.metadata.name {
            Some(name) => name.clone(),
            None => return Ok(()),
        };

        if !self.endpoint_is_relevant(&name).await? {
            debug!("Ignoring endpoints of undiscovered service: {}", name);
            if change == ResourceChange::Deleted {
                self.state.lock().await.endpoints.remove(&name);
            }
            return Ok(());
        }

        let mut state = self.state.lock().await;
        match change {
            ResourceChange::Deleted => {
                state.endpoints.remove(&name);
                state.endpoint_metric.update(ResourceChange::Deleted, &name, &name);
            }
            ResourceChange::Added | ResourceChange::Modified => {
                let addresses = endpoint_addresses(ep);
                debug!("Endpoints for {} now {:?}", name, addresses);
                state.endpoints.insert(name.clone(), addresses);
                state.endpoint_metric.update(ResourceChange::Added, &name, &name);
            }
        }
        recompute_pod_metric(&mut state);
        Ok(())
    }

    /// Handle one Pod watch event. Only deletion carries logic: pod counts
    /// are derived from endpoints, but a deleted pod may mean the service
    /// lost its last replica or is being rolled.
    pub async fn handle_pod_event(&self, change: ResourceChange, pod: &Pod) -> Result<()> {
        match change {
            ResourceChange::Deleted => self.handle_pod_deleted(pod).await,
            ResourceChange::Added | ResourceChange::Modified => Ok(()),
        }
    }

    async fn handle_pod_deleted(&self, pod: &Pod) -> Result<()> {
        let name = match &pod.metadata.name {
            Some(name) => name.clone(),
            None => return Ok(()),
        };

        self.wait_for_pod_termination(&name).await?;

        // grace period before deciding whether a replacement replica came up
        tokio::time::sleep(Duration::from_millis(self.config.pod_replica_startup_timeout_ms)).await;

        let service = self.service_for_pod(pod).await;

        if let Some(prefix) = &pod.metadata.generate_name {
            let pods = self.reader.list_pods().await?;
            // prefix match only, may catch an unrelated pod under
            // concurrent deployments
            let replacement = pods.iter().any(|candidate| {
                candidate.metadata.name.as_deref() != Some(name.as_str())
                    && candidate
                        .metadata
                        .name
                        .as_deref()
                        .map(|n| n.starts_with(prefix.as_str()))
                        .unwrap_or(false)
            });
            if replacement {
                if let Some(service) = &service {
                    debug!("Replacement replica for service {} detected after pod {} left", service, name);
                    self.wait_for_pod_startup(service).await?;
                    return Ok(());
                }
            }
        }

        // pods gone but the Service object persists: deregister so a later
        // Service event can re-add it once replicas return
        if let Some(service) = service {
            let (dried_up, tracked) = {
                let state = self.state.lock().await;
                (
                    state.endpoints.get(&service).map(|a| a.is_empty()).unwrap_or(true),
                    state.selectors.contains_key(&service),
                )
            };
            if dried_up && tracked {
                info!("Endpoints of service {} dried up after pod {} left", service, name);
                match self.reader.get_service(&service).await {
                    Ok(Some(svc)) => self.deregister_service(&service, &svc).await?,
                    Ok(None) => {
                        debug!("Service object {} is already gone", service);
                        let placeholder = Service {
                            metadata: kube::api::ObjectMeta {
                                name: Some(service.clone()),
                                ..Default::default()
                            },
                            ..Default::default()
                        };
                        self.deregister_service(&service, &placeholder).await?;
                    }
                    Err(e) => {
                        error!("Failed to query service {}: {}", service, e);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Poll until the service has at least one endpoint address. Fails with
    /// a "service removed" error when the selector disappears mid-wait.
    async fn wait_for_pod_startup(&self, name: &str) -> Result<()> {
        let interval = Duration::from_millis(self.config.pod_startup_timeout_ms);
        let mut iterations: u32 = 0;
        loop {
            {
                let state = self.state.lock().await;
                if !state.selectors.contains_key(name) {
                    return Err(CoreError::ServiceRemoved(name.to_string()));
                }
                if state.endpoints.get(name).map(|a| !a.is_empty()).unwrap_or(false) {
                    return Ok(());
                }
            }
            iterations += 1;
            if iterations % 10 == 0 {
                info!("Still waiting for pods of service {} ({} checks)", name, iterations);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// A deleted pod can remain readable for a short window; poll until the
    /// API stops returning it.
    async fn wait_for_pod_termination(&self, name: &str) -> Result<()> {
        let interval = Duration::from_millis(self.config.pod_termination_timeout_ms);
        loop {
            match self.reader.get_pod(name).await {
                Ok(Some(_)) => {
                    debug!("Pod {} still terminating", name);
                    tokio::time::sleep(interval).await;
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    error!("Failed to query pod {}: {}", name, e);
                    return Err(e);
                }
            }
        }
    }

    /// The owning service of a pod, found by selector containment
    async fn service_for_pod(&self, pod: &Pod) -> Option<String> {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let state = self.state.lock().await;
        state
            .selectors
            .iter()
            .find(|(_, selector)| {
                !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .map(|(name, _)| name.clone())
    }

    /// A Service object is relevant iff its labels carry the configured
    /// discovery label/value pair exactly.
    fn is_relevant(&self, svc: &Service) -> bool {
        svc.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.config.discovery_label_name))
            .map(|value| value == &self.config.discovery_label_value)
            .unwrap_or(false)
    }

    /// Endpoints matter when their service is tracked, or when the Service
    /// object exists and carries the discovery label (events may arrive
    /// before the service handler finishes registering).
    async fn endpoint_is_relevant(&self, name: &str) -> Result<bool> {
        if self.state.lock().await.selectors.contains_key(name) {
            return Ok(true);
        }
        match self.reader.get_service(name).await {
            Ok(Some(svc)) => Ok(self.is_relevant(&svc)),
            Ok(None) => {
                debug!("No service object behind endpoints {}", name);
                Ok(false)
            }
            Err(e) => {
                error!("Failed to query service {}: {}", name, e);
                self.fault
                    .produce_fault_indication(
                        "K8S_QUERY_FAILED",
                        &format!("Failed to query service {}: {}", name, e),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Declared port of a service, preferring the annotation override
    fn service_port(&self, svc: &Service) -> Option<i32> {
        let annotated = svc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&self.config.port_annotation))
            .and_then(|p| p.parse().ok());
        if annotated.is_some() {
            return annotated;
        }
        svc.spec.as_ref()?.ports.as_ref()?.first().map(|p| p.port)
    }

    /// Assemble the service record: cluster-internal URL, protocol, labels,
    /// annotation-mapped fields and (when enabled) the ingress base URL.
    async fn build_record(&self, svc: &Service, port: Option<i32>) -> ServiceRecord {
        let name = svc.metadata.name.clone().unwrap_or_default();
        let annotations = svc.metadata.annotations.clone().unwrap_or_default();
        let labels = svc.metadata.labels.clone().unwrap_or_default();

        let protocol = annotations
            .get(&self.config.protocol_annotation)
            .cloned()
            .unwrap_or_else(|| {
                if self.config.use_https { "https".to_string() } else { "http".to_string() }
            });

        let serviceurl = match port {
            Some(port) => format!("{}:{}", name, port),
            None => name.clone(),
        };

        let ingress_baseurl = if self.config.ingress_enabled {
            self.resolve_ingress_url(&name, &annotations).await
        } else {
            annotations.get(&self.config.external_url_annotation).cloned()
        };

        let mut extra = HashMap::new();
        for (annotation, field) in &self.config.extra_annotations {
            if let Some(value) = annotations.get(annotation) {
                extra.insert(field.clone(), value.clone());
            }
        }

        let mut record = ServiceRecord {
            name: name.clone(),
            serviceurl,
            ingress_baseurl,
            protocol,
            ui_content_config_context: annotations
                .get(&self.config.ui_content_config_context_annotation)
                .cloned(),
            app_name: labels.get(&self.config.app_name_label).cloned().unwrap_or_default(),
            version: labels.get(&self.config.app_version_label).cloned().unwrap_or_default(),
            extra,
            ..Default::default()
        };
        record.refresh_uid();
        record
    }

    /// Look the service up in a freshly queried ingress map. Lookup failure
    /// falls back to the external-URL annotation, absent included.
    async fn resolve_ingress_url(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Option<String> {
        match self.reader.list_ingresses(&self.namespace).await {
            Ok(ingresses) => {
                let targets = ingress_targets(&ingresses);
                match targets.get(name) {
                    Some(target) => Some(ingress_base_url(target, &self.config.ingress_tls_ports)),
                    None => {
                        debug!("No ingress rule routes to service {}", name);
                        annotations.get(&self.config.external_url_annotation).cloned()
                    }
                }
            }
            Err(e) => {
                warn!("Ingress lookup for {} failed: {}", name, e);
                annotations.get(&self.config.external_url_annotation).cloned()
            }
        }
    }

    /// Common failure path for all three streams: raise a fault, log, wait
    /// out the configured interval, then let the caller re-establish.
    async fn watch_failed(&self, stream: &str, error: &str, interval: Duration) {
        error!("{} watch stream failed: {}", stream, error);
        self.fault
            .produce_fault_indication(
                "K8S_WATCH_FAILED",
                &format!(
                    "{} watch stream failed ({}), reconnecting in {}s",
                    stream,
                    error,
                    interval.as_secs()
                ),
            )
            .await;
        tokio::time::sleep(interval).await;
    }
}

/// Addresses of the first subset: the wholesale replacement value for the
/// endpoint map.
fn endpoint_addresses(ep: &Endpoints) -> Vec<String> {
    ep.subsets
        .as_ref()
        .and_then(|subsets| subsets.first())
        .and_then(|subset| subset.addresses.as_ref())
        .map(|addrs| addrs.iter().map(|a| a.ip.clone()).collect())
        .unwrap_or_default()
}

/// Rebuild the pod metric from the whole endpoint map, one entry per
/// address keyed by IP.
fn recompute_pod_metric(state: &mut WatcherState) {
    state.pod_metric.reset();
    for (service, addresses) in &state.endpoints {
        for ip in addresses {
            state.pod_metric.add(ip, service);
        }
    }
}

async fn watch_services(watcher: Arc<ClusterWatcher>, api: Api<Service>) {
    let interval = watcher.config.service_watch_reconnect();
    loop {
        let stream = match api.watch(&WatchParams::default(), "0").await {
            Ok(stream) => stream,
            Err(e) => {
                watcher.watch_failed("Service", &e.to_string(), interval).await;
                continue;
            }
        };
        futures::pin_mut!(stream);
        loop {
            match stream.try_next().await {
                Ok(Some(WatchEvent::Added(svc))) => {
                    if let Err(e) = watcher.handle_service_event(ResourceChange::Added, &svc).await {
                        warn!("Service add handling failed: {}", e);
                    }
                }
                Ok(Some(WatchEvent::Modified(svc))) => {
                    if let Err(e) = watcher.handle_service_event(ResourceChange::Modified, &svc).await {
                        warn!("Service modify handling failed: {}", e);
                    }
                }
                Ok(Some(WatchEvent::Deleted(svc))) => {
                    if let Err(e) = watcher.handle_service_event(ResourceChange::Deleted, &svc).await {
                        warn!("Service delete handling failed: {}", e);
                    }
                }
                Ok(Some(WatchEvent::Bookmark(_))) => {}
                Ok(Some(WatchEvent::Error(status))) => {
                    watcher.watch_failed("Service", &status.message, interval).await;
                    break;
                }
                Ok(None) => {
                    debug!("Service watch stream closed, re-establishing");
                    break;
                }
                Err(e) => {
                    watcher.watch_failed("Service", &e.to_string(), interval).await;
                    break;
                }
            }
        }
    }
}

async fn watch_endpoints(watcher: Arc<ClusterWatcher>, api: Api<Endpoints>) {
    let interval = watcher.config.endpoint_watch_reconnect();
    loop {
        let stream = match api.watch(&WatchParams::default(), "0").await {
            Ok(stream) => stream,
            Err(e) => {
                watcher.watch_failed("Endpoints", &e.to_string(), interval).await;
                continue;
            }
        };
        futures::pin_mut!(stream);
        loop {
            match stream.try_next().await {
                Ok(Some(WatchEvent::Added(ep))) => {
                    if let Err(e) = watcher.handle_endpoint_event(ResourceChange::Added, &ep).await {
                        warn!("Endpoints add handling failed: {}", e);
                    }
                }
                Ok(Some(WatchEvent::Modified(ep))) => {
                    if let Err(e) = watcher.handle_endpoint_event(ResourceChange::Modified, &ep).await {
                        warn!("Endpoints modify handling failed: {}", e);
                    }
                }
                Ok(Some(WatchEvent::Deleted(ep))) => {
                    if let Err(e) = watcher.handle_endpoint_event(ResourceChange::Deleted, &ep).await {
                        warn!("Endpoints delete handling failed: {}", e);
                    }
                }
                Ok(Some(WatchEvent::Bookmark(_))) => {}
                Ok(Some(WatchEvent::Error(status))) => {
                    watcher.watch_failed("Endpoints", &status.message, interval).await;
                    break;
                }
                Ok(None) => {
                    debug!("Endpoints watch stream closed, re-establishing");
                    break;
                }
                Err(e) => {
                    watcher.watch_failed("Endpoints", &e.to_string(), interval).await;
                    break;
                }
            }
        }
    }
}

async fn watch_pods(watcher: Arc<ClusterWatcher>, api: Api<Pod>) {
    let interval = watcher.config.pod_watch_reconnect();
    loop {
        let stream = match api.watch(&WatchParams::default(), "0").await {
            Ok(stream) => stream,
            Err(e) => {
                watcher.watch_failed("Pod", &e.to_string(), interval).await;
                continue;
            }
        };
        futures::pin_mut!(stream);
        loop {
            match stream.try_next().await {
                Ok(Some(WatchEvent::Added(pod))) => {
                    if let Err(e) = watcher.handle_pod_event(ResourceChange::Added, &pod).await {
                        warn!("Pod add handling failed: {}", e);
                    }
                }
                Ok(Some(WatchEvent::Modified(pod))) => {
                    if let Err(e) = watcher.handle_pod_event(ResourceChange::Modified, &pod).await {
                        warn!("Pod modify handling failed: {}", e);
                    }
                }
                Ok(Some(WatchEvent::Deleted(pod))) => {
                    if let Err(e) = watcher.handle_pod_event(ResourceChange::Deleted, &pod).await {
                        warn!("Pod delete handling failed: {}", e);
                    }
                }
                Ok(Some(WatchEvent::Bookmark(_))) => {}
                Ok(Some(WatchEvent::Error(status))) => {
                    watcher.watch_failed("Pod", &status.message, interval).await;
                    break;
                }
                Ok(None) => {
                    debug!("Pod watch stream closed, re-establishing");
                    break;
                }
                Err(e) => {
                    watcher.watch_failed("Pod", &e.to_string(), interval).await;
                    break;
                }
            }
        }
    }
}
