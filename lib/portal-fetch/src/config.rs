//! Fetch engine configuration

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Configuration of the fetch engine
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchConfig {
    /// Base delay between fetch retries (ms)
    pub config_fetch_retry_period_ms: u64,

    /// Upper bound for the computed retry delay (ms)
    pub config_fetch_max_retry_period_ms: u64,

    /// Highest loop id allowed per key before a retry chain is abandoned
    pub max_loop_id: u64,

    /// Configuration files fetched from every discovered service
    pub items: Vec<ConfigItemSpec>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            config_fetch_retry_period_ms: 1_000,
            config_fetch_max_retry_period_ms: 32_000,
            max_loop_id: 1_000,
            items: Vec::new(),
        }
    }
}

impl FetchConfig {
    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.config_fetch_retry_period_ms)
    }

    pub fn max_retry_period(&self) -> Duration {
        Duration::from_millis(self.config_fetch_max_retry_period_ms)
    }
}

/// One configuration file fetched from each discovered service
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigItemSpec {
    /// Name the stored configuration is filed under
    pub config_name: String,

    /// File name requested from the service's config context
    pub config_file_name: String,

    /// Schema every fetched payload must satisfy
    #[serde(default)]
    pub schema: Option<Value>,

    /// Additional schemas the payload must also satisfy
    #[serde(default)]
    pub additional_schemas: Vec<Value>,

    /// Store an empty/default payload when the retry limit is exhausted
    #[serde(default)]
    pub allow_empty_config: bool,

    /// Payload stored on exhaustion instead of the empty object
    #[serde(default)]
    pub config_default: Option<Value>,

    /// Cap on HTTP-status failures; transport failures retry indefinitely
    #[serde(default)]
    pub limit_of_tries: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: FetchConfig = serde_json::from_str(
            r#"{"items": [{"configName": "apps", "configFileName": "config.json"}]}"#,
        )
        .expect("valid config");

        assert_eq!(config.items.len(), 1);
        assert_eq!(config.items[0].config_name, "apps");
        assert!(config.items[0].schema.is_none());
        assert!(config.items[0].limit_of_tries.is_none());
        assert_eq!(config.retry_period(), Duration::from_millis(1_000));
        assert_eq!(config.max_loop_id, 1_000);
    }
}
