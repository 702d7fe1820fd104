//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

/// Shortest backoff applied to a retryable error.
const MIN_BACKOFF: Duration = Duration::from_secs(2);

/// Longest backoff applied to a retryable error.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// A required object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Kind of the missing object.
        kind: String,
        /// Name of the missing object.
        name: String,
    },

    /// Optimistic concurrency conflict on write
    #[error("conflict writing {kind} '{name}'")]
    Conflict {
        /// Kind of the object being written.
        kind: String,
        /// Name of the object being written.
        name: String,
    },

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML patch document error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Operator configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Check if this error indicates a write conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on conflicts, network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409 || api_err.code == 404
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::NotFound { .. } | Error::Conflict { .. } | Error::Transient(_) => true,
            Error::Validation(_) | Error::Permanent(_) | Error::MissingField(_) => false,
            Error::Serialization(_) | Error::Yaml(_) | Error::Config(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        self.requeue_after_with_retry_count(0)
    }

    /// Get the requeue duration with exponential backoff over consecutive failures.
    ///
    /// Retryable errors back off from 2s doubling up to 5 minutes; non-retryable
    /// errors wait the full 5 minutes for a spec change.
    pub fn requeue_after_with_retry_count(&self, retry_count: u32) -> Duration {
        if !self.is_retryable() {
            return MAX_BACKOFF;
        }
        let factor = 1u32.checked_shl(retry_count.min(16)).unwrap_or(u32::MAX);
        MIN_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
