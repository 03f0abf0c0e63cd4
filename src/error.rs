//! Error types for the gate operator

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for gate operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// GateServer spec is invalid (permission scoping)
    #[error("validation error: {0}")]
    Validation(String),

    /// Keypair generation or validation failed
    #[error("key generation error: {0}")]
    KeyGeneration(#[from] PkiError),

    /// A dependent artifact could not be constructed
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// A store operation (fetch, apply, update, delete) failed
    #[error("store error during {operation}: {message}")]
    Store {
        /// Operation that failed (e.g. "apply ClusterRole/demo")
        operation: String,
        /// Underlying failure
        message: String,
    },

    /// The store rejected a write because the object changed underneath us
    #[error("conflict during {0}")]
    Conflict(String),

    /// Strict teardown could not delete every dependent artifact
    #[error("finalization error: {0}")]
    Finalization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a synthesis error with the given message
    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::Synthesis(msg.into())
    }

    /// Create a store error for the given operation
    pub fn store(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error for the given operation
    pub fn conflict(operation: impl Into<String>) -> Self {
        Self::Conflict(operation.into())
    }

    /// Create a finalization error with the given message
    pub fn finalization(msg: impl Into<String>) -> Self {
        Self::Finalization(msg.into())
    }

    /// Returns true when the whole reconciliation should be retried quickly
    /// from a fresh read
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
