use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for storage-adapter operations
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Bad backend parameters, surfaced to the caller as a 400
    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    /// The object is encrypted with a different customer key
    #[error("This file is encrypted, the correct key is required: {0}")]
    EncryptionKeyMismatch(String),

    #[error("Operation not implemented: {0}")]
    Unimplemented(String),

    /// Opaque failure of the store or the management service
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl AdapterError {
    /// HTTP status the upstream application reports for this error
    pub fn status_code(&self) -> u16 {
        match self {
            AdapterError::Validation(_) => 400,
            AdapterError::NotFound(_) => 404,
            AdapterError::InvalidPath(_) => 405,
            AdapterError::Forbidden(_) => 403,
            AdapterError::EncryptionKeyMismatch(_) => 400,
            AdapterError::Unimplemented(_) => 501,
            AdapterError::Upstream(_) => 502,
            AdapterError::Io(_) => 500,
            AdapterError::Config(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AdapterError::NotFound(_))
    }
}

/// Result type alias for storage-adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;
