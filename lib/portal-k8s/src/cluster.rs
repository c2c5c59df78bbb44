//! Narrow cluster read contract and its kube-backed implementation

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client};
use portal_core::Result;

/// Read access to the cluster, kept narrow so the watcher can be exercised
/// against an in-memory implementation. Expected absence is `Ok(None)` or
/// an empty list, never an error.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    async fn get_service(&self, name: &str) -> Result<Option<Service>>;
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>>;
    async fn list_pods(&self) -> Result<Vec<Pod>>;
    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>>;
}

/// Cluster reader backed by the Kubernetes API
pub struct KubeClusterReader {
    services: Api<Service>,
    pods: Api<Pod>,
    client: Client,
}

impl KubeClusterReader {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            services: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client.clone(), namespace),
            client,
        }
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        Ok(self.services.get_opt(name).await?)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods.get_opt(name).await?)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.pods.list(&Default::default()).await?.items)
    }

    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>> {
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        Ok(ingresses.list(&Default::default()).await?.items)
    }
}
