//! Error types for the relay

use thiserror::Error;

/// Main error type for relay startup and server operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors (file loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Proxy/HTTP server errors
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
