//! Error types for the import-config controller
//!
//! Errors carry the entity key or source kind they relate to so that log lines
//! and recorded events can be correlated without extra context.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration value
    #[error("validation error for {field}: {message}")]
    Validation {
        /// Name of the offending setting (e.g. "max_concurrent_reconciles")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// A change event that could not be interpreted
    #[error("malformed {source_kind} event: {message}")]
    MalformedEvent {
        /// Source the event arrived on
        source_kind: String,
        /// Description of what is missing or broken
        message: String,
    },

    /// Watch stream failure on one source
    #[error("watch error on {source_kind}: {message}")]
    Watch {
        /// Source whose stream failed
        source_kind: String,
        /// Underlying watcher error
        message: String,
    },

    /// Reconcile failure for a single entity
    #[error("reconcile error for {key}: {message}")]
    Reconcile {
        /// Entity key being reconciled
        key: String,
        /// Description of what failed
        message: String,
        /// Whether the key should be retried with backoff
        retryable: bool,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "dispatcher", "source")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a configuration field
    pub fn validation(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a malformed-event error for the given source kind
    pub fn malformed_event(source_kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedEvent {
            source_kind: source_kind.into(),
            message: msg.into(),
        }
    }

    /// Create a watch error for the given source kind
    pub fn watch(source_kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Watch {
            source_kind: source_kind.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable reconcile error
    pub fn reconcile(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Reconcile {
            key: key.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a reconcile error that must not be retried with backoff
    pub fn reconcile_terminal(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Reconcile {
            key: key.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an internal error with the given message
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

    /// Check if this error is retryable
    ///
    /// Validation and malformed-event errors need a fix upstream and are not
    /// retried. Kubernetes 4xx responses are not retried either.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::MalformedEvent { .. } => false,
            Error::Watch { .. } => true,
            Error::Reconcile { retryable, .. } => *retryable,
            Error::Internal { .. } => true,
        }
    }

    /// Get the entity key if this error is associated with one
    pub fn key(&self) -> Option<&str> {
        match self {
            Error::Reconcile { key, .. } => Some(key),
            _ => None,
        }
    }
}
