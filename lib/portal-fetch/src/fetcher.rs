//! HTTP fetch collaborator

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Failure modes of a config fetch. Status failures count against the
/// bounded retry limit; transport failures retry indefinitely.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Request for one configuration file
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub service_name: String,
    pub url: String,
    pub headers: HashMap<String, String>,
}

/// Narrow fetch contract so the engine can be exercised against scripted
/// responses.
#[async_trait]
pub trait ConfigFetcher: Send + Sync {
    async fn fetch_json(&self, request: &FetchRequest) -> Result<Value, FetchError>;
}

/// Fetcher backed by a shared reqwest client
pub struct HttpConfigFetcher {
    client: reqwest::Client,
}

impl HttpConfigFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpConfigFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigFetcher for HttpConfigFetcher {
    async fn fetch_json(&self, request: &FetchRequest) -> Result<Value, FetchError> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        // a 2xx with an unreadable body never reached a usable state, so it
        // is classified with the connection failures
        response
            .json()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))
    }
}
