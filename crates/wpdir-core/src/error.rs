//! Error types for wpdir core operations.
//!
//! Library-level failures are expressed with `thiserror`. Collaborators
//! (upstream clients, the index engine) report `anyhow` errors which are
//! wrapped into the variants below at the pipeline boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using WpdirError
pub type Result<T> = std::result::Result<T, WpdirError>;

/// Core error types for wpdir operations.
///
/// Package-level errors never escape the update pipeline as fatal: they are
/// logged and turn exactly one record `Closed`.
#[derive(Error, Debug)]
pub enum WpdirError {
    // === Registry Errors ===
    /// An index handle arrived without an identifying slug
    #[error("index handle carries an empty slug")]
    EmptySlug,

    /// The slug is not registered in the corpus
    #[error("unknown {corpus} package: {slug}")]
    UnknownPackage { corpus: String, slug: String },

    /// The package exists but has no live index
    #[error("package {slug} is not indexed")]
    NotIndexed { slug: String },

    /// The requested corpus is not served by this process
    #[error("unknown corpus: {name}")]
    UnknownCorpus { name: String },

    // === Update Pipeline Errors ===
    /// Metadata refresh failed after exhausting the retry policy
    #[error("metadata for {slug} unavailable after {attempts} attempts: {reason}")]
    MetadataUnavailable {
        slug: String,
        attempts: u32,
        reason: String,
    },

    /// Transport failure while talking to an upstream collaborator
    #[error("upstream {operation} failed: {reason}")]
    Upstream { operation: String, reason: String },

    /// The archive host answered with an unexpected status
    #[error("archive download for {slug} returned status {status}")]
    ArchiveStatus { slug: String, status: u16 },

    /// Building or opening a fresh index generation failed
    #[error("index build for {slug} failed: {reason}")]
    IndexBuild { slug: String, reason: String },

    /// Installing a new index generation failed; the old one stays live
    #[error("index swap for {slug} failed: {reason}")]
    Swap { slug: String, reason: String },

    /// The update queue no longer accepts work
    #[error("update queue is closed")]
    QueueClosed,

    // === Search Errors ===
    /// Invalid search pattern (e.g., bad regex)
    #[error("invalid search pattern: {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// No active or persisted search with this id
    #[error("search not found: {id}")]
    SearchNotFound { id: String },

    /// The search manager is shutting down
    #[error("search manager is shut down")]
    ShuttingDown,

    // === Persistence Errors ===
    /// A persisted blob failed framing or checksum validation
    #[error("persisted record {key} is corrupted: {reason}")]
    Corrupted { key: String, reason: String },

    /// The key-value store could not be opened
    #[error("store unavailable at {path}: {reason}")]
    StoreUnavailable { path: PathBuf, reason: String },

    // === Configuration Errors ===
    /// Configuration file parsing failed
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    // === I/O Errors ===
    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl WpdirError {
    /// Returns true if this error forces the affected package `Closed`.
    pub fn closes_package(&self) -> bool {
        matches!(
            self,
            WpdirError::MetadataUnavailable { .. }
                | WpdirError::Upstream { .. }
                | WpdirError::ArchiveStatus { .. }
                | WpdirError::IndexBuild { .. }
                | WpdirError::Swap { .. }
        )
    }

    /// Returns true if retrying on the next cycle may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WpdirError::MetadataUnavailable { .. }
                | WpdirError::Upstream { .. }
                | WpdirError::ArchiveStatus { .. }
                | WpdirError::Io(_)
        )
    }

    /// Create an upstream error from a collaborator failure
    pub fn upstream(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        WpdirError::Upstream {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    /// Create an index build error
    pub fn index_build(slug: impl Into<String>, err: impl std::fmt::Display) -> Self {
        WpdirError::IndexBuild {
            slug: slug.into(),
            reason: format!("{:#}", err),
        }
    }

    /// Create a serialization error
    pub fn serialization(reason: impl Into<String>) -> Self {
        WpdirError::Serialization(reason.into())
    }
}

impl From<bincode::Error> for WpdirError {
    fn from(err: bincode::Error) -> Self {
        WpdirError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for WpdirError {
    fn from(err: serde_json::Error) -> Self {
        WpdirError::Serialization(err.to_string())
    }
}
