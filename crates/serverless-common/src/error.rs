//! Error types for the function controller
//!
//! Errors carry enough context to be logged once by the controller's error
//! policy. Expected failure paths (bad sources, failed builds) never surface
//! here; they are written to the Function's conditions instead.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for function controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a Function spec
    #[error("validation error for {function}: {message}")]
    Validation {
        /// Name of the Function with invalid configuration
        function: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Neither the external nor the default registry secret exists
    #[error("registry configuration error in namespace {namespace}: {message}")]
    RegistryConfig {
        /// Namespace that was searched
        namespace: String,
        /// Description of what's missing
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "snapshot", "build")
        context: String,
    },

    /// The reconcile pass was cancelled between two steps
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a validation error without Function context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            function: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named Function
    pub fn validation_for(function: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            function: function.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a registry configuration error
    pub fn registry_config(namespace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RegistryConfig {
            namespace: namespace.into(),
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

    /// Check if this error is retryable
    ///
    /// Validation, serialization and registry configuration errors need a
    /// change in the cluster before another attempt can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::RegistryConfig { .. } => false,
            Error::Internal { .. } => true,
            Error::Cancelled => false,
        }
    }

    /// Check if this error is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
