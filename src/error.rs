//! Error types for the Meshguard engine and service.

use thiserror::Error;

use crate::policy::PolicyError;

/// Main error type for Meshguard operations.
#[derive(Error, Debug)]
pub enum MeshguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy document was rejected
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// gRPC server or channel errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Meshguard operations.
pub type Result<T> = std::result::Result<T, MeshguardError>;
