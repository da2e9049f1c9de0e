//! Error types for Matrixon telemetry
//!
//! This module defines the error type shared by every crate of the telemetry
//! workspace. Domain crates wrap it in their own enums where they need richer
//! context (see `matrixon_iot::IoTError`).

use std::io;

use thiserror::Error;

/// Matrixon error types
#[derive(Debug, Error)]
pub enum MatrixonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for Matrixon operations
pub type Result<T> = std::result::Result<T, MatrixonError>;

impl From<serde_json::Error> for MatrixonError {
    fn from(err: serde_json::Error) -> Self {
        MatrixonError::Serialization(err.to_string())
    }
}

impl MatrixonError {
    /// Log the error with a severity matching its kind
    pub fn log(&self) {
        match self {
            MatrixonError::Validation(msg) => tracing::warn!("⚠️ Validation error: {}", msg),
            MatrixonError::NotFound(msg) => tracing::debug!("🔍 Not found: {}", msg),
            other => tracing::error!("❌ {}", other),
        }
    }
}
