//! Error types for the VmGroup operator

use thiserror::Error;

use crate::vsphere::BackendError;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for VmGroup specs
    #[error("validation error: {0}")]
    Validation(String),

    /// vCenter backend error
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid operator configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
