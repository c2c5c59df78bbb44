//! Per-resource-kind metric bookkeeping

use portal_api::ResourceChange;
use portal_core::MetricsHub;
use prometheus::IntGauge;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

pub const RESOURCE_SERVICE: &str = "service";
pub const RESOURCE_POD: &str = "pod";
pub const RESOURCE_ENDPOINT: &str = "endpoint";

/// Counter for one watched resource kind.
///
/// Keeps a resource-name -> owning-service map and mirrors the map size
/// into a gauge. With the metrics sink disabled the gauge is absent but
/// the map bookkeeping still runs, so reconciliation logic built on top of
/// it keeps working.
pub struct K8sResourceMetric {
    resource: String,
    entries: HashMap<String, String>,
    gauge: Option<IntGauge>,
    hub: MetricsHub,
    removed_tx: Option<mpsc::UnboundedSender<String>>,
}

impl K8sResourceMetric {
    pub fn new(hub: &MetricsHub, resource: &str) -> Self {
        let gauge = hub.int_gauge(
            &format!("portal_k8s_{}_count", resource),
            &format!("Number of tracked {} resources", resource),
        );
        Self {
            resource: resource.to_string(),
            entries: HashMap::new(),
            gauge,
            hub: hub.clone(),
            removed_tx: None,
        }
    }

    /// Wire a channel that receives the name of every removed resource.
    /// The watcher uses this to cascade pod removal when a service
    /// disappears.
    pub fn on_remove(&mut self, tx: mpsc::UnboundedSender<String>) {
        self.removed_tx = Some(tx);
    }

    pub fn add(&mut self, name: &str, service_name: &str) {
        self.entries.insert(name.to_string(), service_name.to_string());
        self.sync_gauge();
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
        self.sync_gauge();
        if let Some(tx) = &self.removed_tx {
            let _ = tx.send(name.to_string());
        }
    }

    /// Bulk-remove every entry owned by the given service
    pub fn remove_by_service_name(&mut self, service_name: &str) {
        self.entries.retain(|_, owner| owner != service_name);
        self.sync_gauge();
        debug!("Removed {} entries for service {}", self.resource, service_name);
    }

    /// Dispatch a watch change: Added inserts, Deleted removes, Modified is
    /// a no-op. A Service resource is its own owner.
    pub fn update(&mut self, change: ResourceChange, name: &str, service_name: &str) {
        match change {
            ResourceChange::Added => {
                let owner = if self.resource == RESOURCE_SERVICE { name } else { service_name };
                self.add(name, owner);
            }
            ResourceChange::Deleted => self.remove(name),
            ResourceChange::Modified => {}
        }
    }

    /// Clear all entries and zero the gauge, used before a full recompute
    pub fn reset(&mut self) {
        self.entries.clear();
        self.sync_gauge();
    }

    /// Drop the gauge from the exposition entirely (teardown)
    pub fn clear(&mut self) {
        if let Some(gauge) = self.gauge.take() {
            self.hub.delete_metric(&gauge);
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn sync_gauge(&self) {
        if let Some(gauge) = &self.gauge {
            gauge.set(self.entries.len() as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_tracks_map_size() {
        let hub = MetricsHub::new(true);
        let mut metric = K8sResourceMetric::new(&hub, RESOURCE_POD);

        metric.add("10.0.0.1", "domain1");
        metric.add("10.0.0.2", "domain1");
        metric.add("10.0.0.1", "domain1");
        assert_eq!(metric.len(), 2, "re-adding the same key must not double count");

        let text = hub.gather().expect("gather");
        assert!(text.contains("portal_k8s_pod_count 2"));

        metric.remove("10.0.0.1");
        let text = hub.gather().expect("gather");
        assert!(text.contains("portal_k8s_pod_count 1"));
    }

    #[test]
    fn test_disabled_hub_still_bookkeeps() {
        let hub = MetricsHub::disabled();
        let mut metric = K8sResourceMetric::new(&hub, RESOURCE_SERVICE);

        metric.add("domain1", "domain1");
        assert_eq!(metric.len(), 1);
        metric.reset();
        assert!(metric.is_empty());
    }

    #[test]
    fn test_update_dispatch() {
        let hub = MetricsHub::disabled();
        let mut metric = K8sResourceMetric::new(&hub, RESOURCE_SERVICE);

        // a service owns itself regardless of the passed owner
        metric.update(ResourceChange::Added, "domain1", "ignored");
        assert!(metric.contains("domain1"));

        metric.update(ResourceChange::Modified, "domain1", "ignored");
        assert_eq!(metric.len(), 1);

        metric.update(ResourceChange::Deleted, "domain1", "ignored");
        assert!(metric.is_empty());
    }

    #[test]
    fn test_remove_by_service_name() {
        let hub = MetricsHub::disabled();
        let mut metric = K8sResourceMetric::new(&hub, RESOURCE_POD);

        metric.add("10.0.0.1", "domain1");
        metric.add("10.0.0.2", "domain2");
        metric.remove_by_service_name("domain1");

        assert_eq!(metric.len(), 1);
        assert!(metric.contains("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_remove_notifies_channel() {
        let hub = MetricsHub::disabled();
        let mut metric = K8sResourceMetric::new(&hub, RESOURCE_SERVICE);
        let (tx, mut rx) = mpsc::unbounded_channel();
        metric.on_remove(tx);

        metric.add("domain1", "domain1");
        metric.remove("domain1");

        assert_eq!(rx.recv().await.as_deref(), Some("domain1"));
    }

    #[test]
    fn test_clear_removes_gauge() {
        let hub = MetricsHub::new(true);
        let mut metric = K8sResourceMetric::new(&hub, RESOURCE_ENDPOINT);
        metric.add("domain1", "domain1");
        metric.clear();

        let text = hub.gather().expect("gather");
        assert!(!text.contains("portal_k8s_endpoint_count"));
        assert!(metric.is_empty());
    }
}
