//! Statically configured service source
//!
//! Non-Kubernetes-discovered services are declared as a list of
//! `{name, version, URL}` entries. Each configuration change is diffed
//! against the previous snapshot and turned into the same lifecycle events
//! the cluster watcher emits.

use crate::events::ServiceEvents;
use portal_api::{ManualServiceEntry, ResourceChange, ServiceRecord};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub struct ManualServiceConfigHandler {
    services: Arc<RwLock<HashMap<String, ServiceRecord>>>,
    events: ServiceEvents,
}

impl ManualServiceConfigHandler {
    pub fn new(events: ServiceEvents) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn events(&self) -> &ServiceEvents {
        &self.events
    }

    /// Replace the snapshot with a new configuration list and emit the
    /// difference as lifecycle events. Input that fails validation is
    /// logged and treated as an empty list rather than aborting.
    pub async fn handle_service_config_change(&self, raw: Value) {
        let entries: Vec<ManualServiceEntry> = match serde_json::from_value(raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Invalid manual service configuration, treating as empty list: {}", e);
                Vec::new()
            }
        };

        let next: HashMap<String, ServiceRecord> = entries
            .iter()
            .map(|entry| (entry.name.clone(), record_from_entry(entry)))
            .collect();

        let mut current = self.services.write().await;

        for (name, old) in current.iter() {
            if !next.contains_key(name) {
                debug!("Manual service removed from configuration: {}", name);
                self.events.emit(ResourceChange::Deleted, old.clone());
            }
        }

        for (name, record) in &next {
            match current.get(name) {
                Some(old) if old.version != record.version => {
                    debug!("Manual service version changed: {}", name);
                    self.events.emit(ResourceChange::Modified, record.clone());
                }
                Some(_) => {}
                None => {
                    debug!("Manual service added to configuration: {}", name);
                    self.events.emit(ResourceChange::Added, record.clone());
                }
            }
        }

        *current = next;
    }

    /// Replay `Added` for every service in the current snapshot, used to
    /// bootstrap a freshly attached subscriber.
    pub async fn trigger_initial_events(&self) {
        let current = self.services.read().await;
        for record in current.values() {
            self.events.emit(ResourceChange::Added, record.clone());
        }
    }

    pub async fn get_services(&self) -> Vec<ServiceRecord> {
        let current = self.services.read().await;
        current.values().cloned().collect()
    }
}

fn record_from_entry(entry: &ManualServiceEntry) -> ServiceRecord {
    let (protocol, host, path) = split_url(&entry.url);
    let mut record = ServiceRecord {
        name: entry.name.clone(),
        serviceurl: host,
        protocol,
        ui_content_config_context: if path.is_empty() { None } else { Some(path) },
        app_name: entry.name.clone(),
        version: entry.version.clone(),
        ..Default::default()
    };
    record.refresh_uid();
    record
}

/// Split a URL into protocol, host[:port] and path. A missing scheme
/// defaults to http, a missing path to the empty string.
fn split_url(url: &str) -> (String, String, String) {
    let (protocol, rest) = match url.find("://") {
        Some(pos) => (&url[..pos], &url[pos + 3..]),
        None => ("http", url),
    };
    let (host, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };
    (protocol.to_string(), host.to_string(), path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_url() {
        assert_eq!(
            split_url("https://ext.example.com:8443/ui/config"),
            (
                "https".to_string(),
                "ext.example.com:8443".to_string(),
                "/ui/config".to_string()
            )
        );
        assert_eq!(
            split_url("ext.example.com"),
            ("http".to_string(), "ext.example.com".to_string(), String::new())
        );
    }

    #[tokio::test]
    async fn test_version_change_emits_single_modified() {
        let events = ServiceEvents::new();
        let mut rx = events.subscribe();
        let handler = ManualServiceConfigHandler::new(events);

        handler
            .handle_service_config_change(json!([{"name": "A", "version": "1", "URL": "http://a.example.com/ui"}]))
            .await;
        let added = rx.try_recv().expect("added");
        assert_eq!(added.change, ResourceChange::Added);

        handler
            .handle_service_config_change(json!([{"name": "A", "version": "2", "URL": "http://a.example.com/ui"}]))
            .await;
        let modified = rx.try_recv().expect("modified");
        assert_eq!(modified.change, ResourceChange::Modified);
        assert_eq!(modified.service.version, "2");
        assert!(rx.try_recv().is_err(), "no extra added/deleted events");
    }

    #[tokio::test]
    async fn test_removed_entry_emits_deleted() {
        let events = ServiceEvents::new();
        let mut rx = events.subscribe();
        let handler = ManualServiceConfigHandler::new(events);

        handler
            .handle_service_config_change(json!([
                {"name": "A", "version": "1", "URL": "http://a.example.com"},
                {"name": "B", "version": "1", "URL": "http://b.example.com"}
            ]))
            .await;
        let _ = rx.try_recv().expect("added A or B");
        let _ = rx.try_recv().expect("added A or B");

        handler
            .handle_service_config_change(json!([{"name": "A", "version": "1", "URL": "http://a.example.com"}]))
            .await;
        let deleted = rx.try_recv().expect("deleted");
        assert_eq!(deleted.change, ResourceChange::Deleted);
        assert_eq!(deleted.service.name, "B");
        assert!(rx.try_recv().is_err(), "unchanged A emits nothing");
    }

    #[tokio::test]
    async fn test_invalid_input_is_treated_as_empty_list() {
        let events = ServiceEvents::new();
        let mut rx = events.subscribe();
        let handler = ManualServiceConfigHandler::new(events);

        handler
            .handle_service_config_change(json!([{"name": "A", "version": "1", "URL": "http://a.example.com"}]))
            .await;
        let _ = rx.try_recv().expect("added");

        handler
            .handle_service_config_change(json!({"not": "a list"}))
            .await;
        let deleted = rx.try_recv().expect("fail-safe empties the snapshot");
        assert_eq!(deleted.change, ResourceChange::Deleted);
        assert_eq!(deleted.service.name, "A");
    }

    #[tokio::test]
    async fn test_trigger_initial_events_replays_added() {
        let events = ServiceEvents::new();
        let handler = ManualServiceConfigHandler::new(events.clone());

        handler
            .handle_service_config_change(json!([{"name": "A", "version": "1", "URL": "https://a.example.com/ui"}]))
            .await;

        // a subscriber attaching late sees the current snapshot replayed
        let mut rx = events.subscribe();
        handler.trigger_initial_events().await;
        let replay = rx.try_recv().expect("replayed added");
        assert_eq!(replay.change, ResourceChange::Added);
        assert_eq!(replay.service.protocol, "https");
        assert_eq!(replay.service.serviceurl, "a.example.com");
        assert_eq!(replay.service.ui_content_config_context.as_deref(), Some("/ui"));
    }
}
