//! Configuration fetch engine for discovered services
//!
//! This library provides:
//! - The fetch engine driving retryable, cancellable config fetch loops
//! - Exponential backoff with jitter
//! - The HTTP fetch collaborator contract and its reqwest implementation
//! - JSON-schema validation of fetched payloads

pub mod backoff;
pub mod config;
pub mod engine;
pub mod fetcher;
pub mod validate;

pub use config::{ConfigItemSpec, FetchConfig};
pub use engine::{ConfigFetchEngine, StoredConfig};
pub use fetcher::{ConfigFetcher, FetchError, FetchRequest, HttpConfigFetcher};
pub use validate::ConfigValidator;
