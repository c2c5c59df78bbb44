//! Kubernetes discovery for the portal workspace
//!
//! This library provides:
//! - The cluster watcher reconciling Service/Pod/Endpoints streams into
//!   logical service records
//! - Per-resource-kind metric bookkeeping
//! - Ingress base-URL resolution
//! - The narrow cluster read contract and its kube-backed implementation

pub mod cluster;
pub mod config;
pub mod ingress;
pub mod metric;
pub mod watcher;

pub use cluster::{ClusterReader, KubeClusterReader};
pub use config::DiscoveryConfig;
pub use metric::K8sResourceMetric;
pub use watcher::ClusterWatcher;
