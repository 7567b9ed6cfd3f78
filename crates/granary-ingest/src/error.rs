//! Ingest error taxonomy
//!
//! Every failure that crosses a step boundary is one of these variants so the
//! orchestrator can decide on retry policy from the type alone.

use granary_common::types::ChecksumType;
use thiserror::Error;

/// Result type for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Transport unreachable or connection refused
    #[error("Connection error: {0}")]
    Connection(String),

    /// Transport stalled past the configured timeout
    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),

    /// Credentials rejected or undecryptable
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider-side failure unrelated to auth (missing file, access denied, 5xx)
    #[error("Remote resource error: {0}")]
    RemoteResource(String),

    #[error("Invalid checksum for {file}: expected {checksum_type} {expected}, got {actual}")]
    InvalidChecksum {
        file: String,
        checksum_type: ChecksumType,
        expected: String,
        actual: String,
    },

    /// Malformed delivery record
    #[error("Invalid PDR: {0}")]
    InvalidPdr(String),

    #[error("Resources locked: provider {provider}, granule {granule_id}")]
    ResourcesLocked { provider: String, granule_id: String },

    #[error("Collection not found: {data_type}___{version}")]
    CollectionNotFound { data_type: String, version: String },

    #[error("Duplicate file: {0} already exists")]
    DuplicateFile(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Metadata catalog error: {0}")]
    Catalog(String),

    #[error("Metadata document error: {0}")]
    Metadata(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Common(#[from] granary_common::GranaryError),
}

impl IngestError {
    /// Whether the orchestrator may retry the failed step as-is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Connection(_)
                | IngestError::ConnectionTimeout(_)
                | IngestError::RemoteResource(_)
                | IngestError::ResourcesLocked { .. }
        )
    }

    /// Stable error name reported to the orchestrator
    pub fn name(&self) -> &'static str {
        match self {
            IngestError::Connection(_) => "ConnectionError",
            IngestError::ConnectionTimeout(_) => "ConnectionTimeout",
            IngestError::Auth(_) => "AuthError",
            IngestError::RemoteResource(_) => "RemoteResourceError",
            IngestError::InvalidChecksum { .. } => "InvalidChecksumError",
            IngestError::InvalidPdr(_) => "InvalidPdrError",
            IngestError::ResourcesLocked { .. } => "ResourcesLockedError",
            IngestError::CollectionNotFound { .. } => "CollectionNotFound",
            IngestError::DuplicateFile(_) => "DuplicateFile",
            IngestError::UnsupportedProtocol(_) => "UnsupportedProtocol",
            IngestError::Storage(_) => "StorageError",
            IngestError::Queue(_) => "QueueError",
            IngestError::Catalog(_) => "CatalogError",
            IngestError::Metadata(_) => "MetadataError",
            IngestError::Config(_) => "ConfigError",
            IngestError::Io(_) => "IOError",
            IngestError::Json(_) => "JSONError",
            IngestError::Regex(_) => "RegexError",
            IngestError::Common(_) => "CommonError",
        }
    }
}
