//! Error types shared by Granary crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, GranaryError>;

/// Main error type for shared Granary utilities
#[derive(Error, Debug)]
pub enum GranaryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported checksum type: {0}")]
    UnsupportedChecksumType(String),

    #[error("Invalid S3 location: {0}")]
    InvalidLocation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
