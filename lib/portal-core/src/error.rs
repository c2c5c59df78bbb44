use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service removed while operation was in flight: {0}")]
    ServiceRemoved(String),

    #[error("Service declares no container port: {0}")]
    MissingPort(String),

    #[error("Too many concurrent fetch loops for key: {0}")]
    FetchLoopLimit(String),

    #[error("Configuration validation failed: {0}")]
    Validation(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
