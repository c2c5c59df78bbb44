//! Typed lifecycle event channels
//!
//! Events are fanned out over `tokio::sync::broadcast` so any number of
//! consumers can subscribe without the sources knowing about them. A send
//! with no live subscribers is not an error.

use portal_api::{ResourceChange, ServiceRecord};
use tokio::sync::broadcast;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle event for a discovered service
#[derive(Clone, Debug)]
pub struct ServiceEvent {
    pub change: ResourceChange,
    pub service: ServiceRecord,
}

/// Configuration lifecycle event emitted by the fetch engine
#[derive(Clone, Debug)]
pub enum ConfigEvent {
    /// A service's configuration file was fetched, validated and stored
    Updated {
        config_name: String,
        service: ServiceRecord,
    },
    /// All of a service's configuration entries were removed
    Deleted { service: ServiceRecord },
}

/// Broadcast hub for service lifecycle events
#[derive(Clone)]
pub struct ServiceEvents {
    tx: broadcast::Sender<ServiceEvent>,
}

impl ServiceEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    /// Emit a lifecycle event; silently dropped when nobody subscribes
    pub fn emit(&self, change: ResourceChange, service: ServiceRecord) {
        let _ = self.tx.send(ServiceEvent { change, service });
    }
}

impl Default for ServiceEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast hub for configuration lifecycle events
#[derive(Clone)]
pub struct ConfigEvents {
    tx: broadcast::Sender<ConfigEvent>,
}

impl ConfigEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ConfigEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ConfigEvents {
    fn default() -> Self {
        Self::new()
    }
}
