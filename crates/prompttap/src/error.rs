//! Error types for prompttap

use thiserror::Error;

/// Main error type for prompttap operations
#[derive(Error, Debug)]
pub enum TapError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// CA loading and leaf certificate minting errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Packet capture process errors
    #[error("Capture error: {0}")]
    Capture(String),

    /// Listener bind errors
    #[error("Bind error: {0}")]
    Bind(String),

    /// Persistence errors (MongoDB, fallback files)
    #[error("Storage error: {0}")]
    Storage(String),

    /// TLS configuration errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl From<serde_json::Error> for TapError {
    fn from(e: serde_json::Error) -> Self {
        TapError::Serialization(e.to_string())
    }
}

/// Result type alias for prompttap operations
pub type Result<T> = std::result::Result<T, TapError>;
