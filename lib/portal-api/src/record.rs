//! The canonical service record produced by every discovery source

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fallback application name when the discovery labels carry none
pub const UNKNOWN_APP_NAME: &str = "unknownApp";
/// Fallback application version when the discovery labels carry none
pub const UNKNOWN_APP_VERSION: &str = "0.0.0";

/// A discovered backend service together with its resolved base URL.
///
/// Produced by the cluster watcher or the manual config handler, stored by
/// the service collection, and treated as read-only context by the config
/// fetch engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    /// Service name (the registry key)
    pub name: String,

    /// Stable identity derived from application name and version
    #[serde(default)]
    pub uid: String,

    /// Cluster-internal address as `host:port`
    pub serviceurl: String,

    /// Externally reachable base URL resolved from ingress rules, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress_baseurl: Option<String>,

    /// Scheme used to reach the service: `http` or `https`
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Path under which the service serves its UI content configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_content_config_context: Option<String>,

    /// Application name taken from the discovery labels
    #[serde(default)]
    pub app_name: String,

    /// Application version taken from the discovery labels
    #[serde(default)]
    pub version: String,

    /// Additional annotation-mapped fields
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            uid: String::new(),
            serviceurl: String::new(),
            ingress_baseurl: None,
            protocol: default_protocol(),
            ui_content_config_context: None,
            app_name: String::new(),
            version: String::new(),
            extra: HashMap::new(),
        }
    }
}

impl ServiceRecord {
    /// Recompute the stable identity from the current name and version
    /// fields, falling back to `unknownApp`/`0.0.0` when either is absent.
    pub fn refresh_uid(&mut self) {
        self.uid = derive_uid(&self.app_name, &self.version);
    }
}

/// Derive a stable service identity from application name and version.
///
/// Whitespace and `+` (semver build metadata separator) are stripped so the
/// identity is safe to embed in URLs and metric label values.
pub fn derive_uid(app_name: &str, version: &str) -> String {
    let app = if app_name.is_empty() { UNKNOWN_APP_NAME } else { app_name };
    let version = if version.is_empty() { UNKNOWN_APP_VERSION } else { version };
    format!("{}-{}", app, version)
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '+')
        .collect()
}

/// Statically configured service entry for non-Kubernetes-discovered
/// services: name, version and the full URL the service is reachable at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManualServiceEntry {
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(rename = "URL")]
    pub url: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_uid_strips_whitespace_and_plus() {
        assert_eq!(derive_uid("demo app", "1.0.0+build42"), "demoapp-1.0.0build42");
    }

    #[test]
    fn test_derive_uid_fallbacks() {
        assert_eq!(derive_uid("", ""), "unknownApp-0.0.0");
        assert_eq!(derive_uid("widgets", ""), "widgets-0.0.0");
        assert_eq!(derive_uid("", "2.1.0"), "unknownApp-2.1.0");
    }

    #[test]
    fn test_refresh_uid() {
        let mut record = ServiceRecord {
            name: "widgets".to_string(),
            app_name: "widgets".to_string(),
            version: "1.2.3".to_string(),
            ..Default::default()
        };
        record.refresh_uid();
        assert_eq!(record.uid, "widgets-1.2.3");
    }

    #[test]
    fn test_manual_entry_deserializes_url_field() {
        let entry: ManualServiceEntry =
            serde_json::from_str(r#"{"name":"ext","version":"1","URL":"https://ext.example.com/ui"}"#)
                .expect("valid entry");
        assert_eq!(entry.name, "ext");
        assert_eq!(entry.url, "https://ext.example.com/ui");
    }
}
