//! Canonical in-memory registry of discovered services

use crate::events::ServiceEvents;
use portal_api::{ResourceChange, ServiceRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// ServiceCollection holds the latest record for every discovered service
/// and re-emits lifecycle events for its subscribers. It is the aggregation
/// point when several sources (cluster watcher, manual configuration) feed
/// the same downstream consumers.
pub struct ServiceCollection {
    services: Arc<RwLock<HashMap<String, ServiceRecord>>>,
    events: ServiceEvents,
}

impl ServiceCollection {
    pub fn new(events: ServiceEvents) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn events(&self) -> &ServiceEvents {
        &self.events
    }

    /// Store a new service and emit `Added`. A service that is already
    /// registered under the same name is left untouched.
    pub async fn add_service(&self, mut service: ServiceRecord) {
        service.refresh_uid();
        let mut services = self.services.write().await;
        if services.contains_key(&service.name) {
            debug!("Service already registered: {}", service.name);
            return;
        }
        services.insert(service.name.clone(), service.clone());
        drop(services);

        debug!("Registered service: {}", service.name);
        self.events.emit(ResourceChange::Added, service);
    }

    /// Replace an existing service wholesale and emit `Modified`
    pub async fn modify_service(&self, mut service: ServiceRecord) {
        service.refresh_uid();
        let mut services = self.services.write().await;
        if !services.contains_key(&service.name) {
            warn!("Cannot modify unknown service: {}", service.name);
            return;
        }
        services.insert(service.name.clone(), service.clone());
        drop(services);

        debug!("Updated service: {}", service.name);
        self.events.emit(ResourceChange::Modified, service);
    }

    /// Remove a service by name and emit `Deleted` with the stored record
    pub async fn delete_service(&self, service: &ServiceRecord) {
        let mut services = self.services.write().await;
        match services.remove(&service.name) {
            Some(stored) => {
                drop(services);
                debug!("Deregistered service: {}", service.name);
                self.events.emit(ResourceChange::Deleted, stored);
            }
            None => warn!("Cannot delete unknown service: {}", service.name),
        }
    }

    /// Snapshot of all registered services as defensive copies
    pub async fn get_services(&self) -> Vec<ServiceRecord> {
        let services = self.services.read().await;
        services.values().cloned().collect()
    }

    /// Re-emit `Modified` for an existing entry; returns whether the
    /// service was found.
    pub async fn force_update_service(&self, name: &str) -> bool {
        let services = self.services.read().await;
        match services.get(name).cloned() {
            Some(service) => {
                drop(services);
                self.events.emit(ResourceChange::Modified, service);
                true
            }
            None => false,
        }
    }

    /// Route a lifecycle change from any source to the matching operation
    pub async fn apply(&self, change: ResourceChange, service: ServiceRecord) {
        match change {
            ResourceChange::Added => self.add_service(service).await,
            ResourceChange::Modified => self.modify_service(service).await,
            ResourceChange::Deleted => self.delete_service(&service).await,
        }
    }

    pub async fn service_count(&self) -> usize {
        let services = self.services.read().await;
        services.len()
    }
}
