//! Discovery configuration

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of the cluster watcher.
///
/// Loaded from the agent configuration file; every field has a default so a
/// partial document is enough.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    /// Namespace watched for services. Overridden by the service-account
    /// namespace file when one is mounted.
    pub namespace: String,

    /// Directory holding the mounted service-account files
    pub service_account_dir: PathBuf,

    /// Label a Service must carry to be discovered
    pub discovery_label_name: String,

    /// Required value of the discovery label
    pub discovery_label_value: String,

    /// Seconds to wait before re-establishing a failed Service watch
    pub service_watch_reconnect_secs: u64,

    /// Seconds to wait before re-establishing a failed Pod watch
    pub pod_watch_reconnect_secs: u64,

    /// Seconds to wait before re-establishing a failed Endpoints watch
    pub endpoint_watch_reconnect_secs: u64,

    /// Poll interval while waiting for a service's pods to start (ms)
    pub pod_startup_timeout_ms: u64,

    /// Poll interval while waiting for a deleted pod to vanish (ms)
    pub pod_termination_timeout_ms: u64,

    /// Grace period before looking for a replacement replica (ms)
    pub pod_replica_startup_timeout_ms: u64,

    /// Whether to resolve external ingress base URLs
    pub ingress_enabled: bool,

    /// Backend ports regarded as TLS when building ingress base URLs
    pub ingress_tls_ports: Vec<i32>,

    /// Assume https for services without a protocol annotation
    pub use_https: bool,

    /// Annotation carrying a port override
    pub port_annotation: String,

    /// Annotation carrying a protocol override
    pub protocol_annotation: String,

    /// Annotation carrying the externally reachable base URL fallback
    pub external_url_annotation: String,

    /// Annotation carrying the UI content configuration context path
    pub ui_content_config_context_annotation: String,

    /// Label carrying the application name
    pub app_name_label: String,

    /// Label carrying the application version
    pub app_version_label: String,

    /// Extra annotations copied into the record: annotation key -> field name
    pub extra_annotations: HashMap<String, String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            service_account_dir: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount"),
            discovery_label_name: "portal-ui".to_string(),
            discovery_label_value: "enabled".to_string(),
            service_watch_reconnect_secs: 30,
            pod_watch_reconnect_secs: 30,
            endpoint_watch_reconnect_secs: 30,
            pod_startup_timeout_ms: 1_000,
            pod_termination_timeout_ms: 1_000,
            pod_replica_startup_timeout_ms: 3_000,
            ingress_enabled: false,
            ingress_tls_ports: vec![443, 8443],
            use_https: false,
            port_annotation: "portal.ui/port".to_string(),
            protocol_annotation: "portal.ui/protocol".to_string(),
            external_url_annotation: "portal.ui/external-baseurl".to_string(),
            ui_content_config_context_annotation: "portal.ui/ui-content-config-context".to_string(),
            app_name_label: "app.kubernetes.io/name".to_string(),
            app_version_label: "app.kubernetes.io/version".to_string(),
            extra_annotations: HashMap::new(),
        }
    }
}

impl DiscoveryConfig {
    /// Namespace to operate in: the mounted service-account namespace when
    /// available, the configured one otherwise.
    pub fn resolve_namespace(&self) -> String {
        let path = self.service_account_dir.join("namespace");
        match std::fs::read_to_string(&path) {
            Ok(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
            _ => self.namespace.clone(),
        }
    }

    pub fn service_watch_reconnect(&self) -> Duration {
        Duration::from_secs(self.service_watch_reconnect_secs)
    }

    pub fn pod_watch_reconnect(&self) -> Duration {
        Duration::from_secs(self.pod_watch_reconnect_secs)
    }

    pub fn endpoint_watch_reconnect(&self) -> Duration {
        Duration::from_secs(self.endpoint_watch_reconnect_secs)
    }
}
