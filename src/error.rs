//! Error types for the bucket cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the bucket cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error outside the two cache stores
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Local Store Errors
    // =========================================================================
    /// Local I/O failure on the metadata (stat) side
    #[error("metadata store error for key {key}: {source}")]
    Metadata {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Local I/O failure on the content side
    #[error("data store error for key {key}: {source}")]
    DataStore {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Per-entry eviction failure (non-fatal, retried on the next pass)
    #[error("eviction of {key} failed: {reason}")]
    Eviction { key: String, reason: String },

    /// Key cannot be mapped onto the cache layout
    #[error("invalid cache key {0:?}")]
    InvalidKey(String),

    // =========================================================================
    // Consistency Errors
    // =========================================================================
    /// Local and remote copies diverge
    #[error(
        "checksum mismatch for {key}: local len={local_len} crc64={local_crc64}; \
         remote len={remote_len} crc64={}",
        .remote_crc64.map(|c| c.to_string()).unwrap_or_else(|| "<none>".to_string())
    )]
    ChecksumMismatch {
        key: String,
        local_len: u64,
        local_crc64: u64,
        remote_len: u64,
        remote_crc64: Option<u64>,
    },

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// Remote object does not exist
    #[error("remote object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    /// Remote store failure
    #[error("remote store error: {0}")]
    Remote(String),

    // =========================================================================
    // Startup / Lifecycle Errors
    // =========================================================================
    /// Configuration or credentials error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The eviction engine is no longer running
    #[error("eviction engine stopped")]
    EngineStopped,

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Wrap a metadata-side I/O failure
    pub fn metadata(key: impl Into<String>, source: std::io::Error) -> Self {
        Error::Metadata {
            key: key.into(),
            source,
        }
    }

    /// Wrap a data-side I/O failure
    pub fn data_store(key: impl Into<String>, source: std::io::Error) -> Self {
        Error::DataStore {
            key: key.into(),
            source,
        }
    }

    /// True for errors on the admission path that fall back to pass-through
    pub fn is_local_store(&self) -> bool {
        matches!(self, Error::Metadata { .. } | Error::DataStore { .. })
    }
}
