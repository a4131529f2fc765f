//! # Error Types
//!
//! Error types for the edgeplane control plane using `thiserror`.

use super::certificate::CertificateError;

/// Custom result type for edgeplane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the edgeplane control plane
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation errors for a single input (labels, resources)
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// A domain or resource is already owned by somebody else
    #[error("{message}")]
    Conflict { message: String, resource_type: String },

    /// Service registry (Docker Engine) errors
    #[error("Registry error: {message}")]
    Registry {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Network transport errors (gRPC, HTTP)
    #[error("Transport error: {0}")]
    Transport(String),

    /// ACME order or account errors
    #[error("ACME error: {0}")]
    Acme(String),

    /// Certificate or file storage errors
    #[error("Storage error: {context}")]
    Storage {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Certificate material could not be decoded or used
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// Snapshot failed its cross-resource consistency check
    #[error("Inconsistent snapshot: {0}")]
    Inconsistent(String),

    /// Timeout errors
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a conflict error
    pub fn conflict<M: Into<String>, R: Into<String>>(message: M, resource_type: R) -> Self {
        Self::Conflict { message: message.into(), resource_type: resource_type.into() }
    }

    /// Create a registry error
    pub fn registry<S: Into<String>>(message: S) -> Self {
        Self::Registry { message: message.into(), source: None }
    }

    /// Create a registry error with source
    pub fn registry_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Registry { message: message.into(), source: Some(source) }
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create an ACME error
    pub fn acme<S: Into<String>>(message: S) -> Self {
        Self::Acme(message.into())
    }

    /// Create a storage error for a failed file operation
    pub fn storage<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Storage { source, context: context.into() }
    }

    /// Create an inconsistent snapshot error
    pub fn inconsistent<S: Into<String>>(message: S) -> Self {
        Self::Inconsistent(message.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(context: S, source: serde_json::Error) -> Self {
        Self::Serialization { source, context: context.into() }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error may succeed when the operation is attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Registry { .. }
                | Error::Transport(_)
                | Error::Timeout { .. }
                | Error::Io(_)
                | Error::Storage { .. }
        )
    }

    /// Errors that are scoped to a single service and must never abort a pass
    pub fn is_service_scoped(&self) -> bool {
        matches!(self, Error::Validation { .. } | Error::Conflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON processing failed".to_string() }
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Failed to load configuration", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::validation(errors.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(error: tonic::transport::Error) -> Self {
        Self::transport(error.to_string())
    }
}
