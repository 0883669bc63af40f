//! Error types for the Tollgate limiter.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// A required configuration parameter was not supplied
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    /// A token request that no configuration of the bucket could satisfy
    #[error("Invalid token request: {requested} tokens against capacity {capacity}")]
    InvalidTokenRequest { requested: f64, capacity: f64 },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A slow-start transition was started while one is already running
    #[error("A slow-start transition is already running")]
    SlowStartActive,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
