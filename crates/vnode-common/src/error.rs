//! Error types for vnode
//!
//! Errors are structured with fields to aid debugging in production.
//! Kubernetes API errors keep the underlying kube-rs error so callers can
//! classify them with the predicates in [`crate::kube_utils`].

use std::time::Duration;

use thiserror::Error;

use crate::kube_utils;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for vnode operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An object does not exist (API server or provider side)
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object (e.g. "pod", "lease")
        kind: String,
        /// Name or key of the missing object
        name: String,
    },

    /// Error returned by the provider plugin
    #[error("provider error: {message}")]
    Provider {
        /// Description of what failed
        message: String,
        /// Whether the provider considers this error transient
        retryable: bool,
    },

    /// The request was rejected as malformed and will never succeed as-is
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of what's invalid
        message: String,
    },

    /// Container environment could not be materialized
    #[error("environment error for pod {pod}: {message}")]
    Environment {
        /// `namespace/name` of the pod being resolved
        pod: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// An operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline that was exceeded
        after: Duration,
    },

    /// A queue handler panicked
    #[error("handler panicked: {message}")]
    Panicked {
        /// Panic payload rendered as text
        message: String,
    },

    /// The surrounding context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "queue", "informer", "lease")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given object kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a retryable provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a provider error that retrying will not fix
    pub fn provider_permanent(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an invalid-input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: msg.into(),
        }
    }

    /// Create an environment resolution error for a pod
    pub fn environment(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Environment {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create an error describing a recovered panic
    pub fn panicked(msg: impl Into<String>) -> Self {
        Self::Panicked {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for API 404s and provider-side not-found errors
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube { source } => kube_utils::is_not_found(source),
            _ => false,
        }
    }

    /// Minimum delay the API server asked for before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Kube { source } => kube_utils::suggested_backoff(source),
            _ => None,
        }
    }

    /// True for API 409 responses caused by an optimistic-lock failure
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source } if kube_utils::is_conflict(source))
    }

    /// True for API 409 responses caused by a create of an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube { source } if kube_utils::is_already_exists(source))
    }

    /// True when the request itself is invalid
    pub fn is_invalid(&self) -> bool {
        match self {
            Error::InvalidInput { .. } => true,
            Error::Kube { source } => kube_utils::is_invalid(source),
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Invalid input and serialization errors need a spec change.
    /// Kubernetes errors are retryable when transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => kube_utils::is_transient(source),
            Error::NotFound { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::InvalidInput { .. } => false,
            Error::Environment { .. } => true,
            Error::Serialization { .. } => false,
            Error::Timeout { .. } => true,
            Error::Panicked { .. } => true,
            Error::Cancelled => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
