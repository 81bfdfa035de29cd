//! Error types for the dormant orchestrator

use thiserror::Error;

/// Main error type for dormant operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration or request
    #[error("validation error: {0}")]
    Validation(String),

    /// The caller is not allowed to perform the operation
    #[error("permission denied: {0}")]
    Forbidden(String),

    /// Remote call failed for a reason that may clear up on retry
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Remote call or wait exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// Durable state could not be read or written
    #[error("state store error: {0}")]
    StateStore(String),

    /// Declared service dependencies form a cycle
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// Requested capacity cannot host the cluster-critical workloads
    #[error("bootstrap capacity check failed: {0}")]
    Bootstrap(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation was cancelled between steps
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a permission error with the given message
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a transient cluster error with the given message
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a state store error with the given message
    pub fn state_store(msg: impl Into<String>) -> Self {
        Self::StateStore(msg.into())
    }

    /// Create a bootstrap error with the given message
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// HTTP status code of the underlying API error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    /// Errors that abort the whole operation immediately.
    ///
    /// Authorization failures and malformed requests will fail identically
    /// on every attempt, and a dependency cycle or invalid configuration
    /// cannot be fixed by the orchestrator.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Forbidden(_) | Self::Validation(_) | Self::DependencyCycle(_) => true,
            Self::Kube(_) => matches!(self.status_code(), Some(400 | 401 | 403 | 422)),
            _ => false,
        }
    }

    /// True if the resource does not exist (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }
}

/// Classification consulted by [`crate::retry::retry_with_backoff`]
pub trait Retryable {
    /// Whether another attempt may succeed
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(_) => !self.is_fatal() && !self.is_not_found(),
            Self::Cluster(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }
}
