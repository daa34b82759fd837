/*!
Error types for the Strongbox backup engine.
*/

use thiserror::Error;

/// Result type used throughout the Strongbox core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur during backup, retention and restore operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Another backup run holds the in-progress flag
    #[error("Backup already in progress")]
    AlreadyRunning,

    /// Another restore run holds the restore flag
    #[error("Restore already in progress")]
    RestoreInProgress,

    /// Export tool or file copy failure while capturing the primary store
    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    /// Packaging failure while building the archive
    #[error("Archive creation failed: {0}")]
    ArchiveFailed(String),

    /// Unknown backup id
    #[error("Backup not found: {0}")]
    NotFound(String),

    /// The backup exists but cannot be used for the requested operation
    #[error("Invalid backup state: {0}")]
    InvalidState(String),

    /// Rejected configuration update
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Extraction or replay failure during restore
    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    /// Archive on disk no longer matches the checksum in the ledger
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Metrics registry or tracing subscriber setup failure
    #[error("Observability error: {0}")]
    Observability(String),

    /// I/O errors during ledger or file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackupError {
    /// Create a new capture error
    pub fn capture<S: Into<String>>(msg: S) -> Self {
        Self::CaptureFailed(msg.into())
    }

    /// Create a new archive error
    pub fn archive<S: Into<String>>(msg: S) -> Self {
        Self::ArchiveFailed(msg.into())
    }

    /// Create a new restore error
    pub fn restore<S: Into<String>>(msg: S) -> Self {
        Self::RestoreFailed(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a new observability error
    pub fn observability<S: Into<String>>(msg: S) -> Self {
        Self::Observability(msg.into())
    }

    /// True for the errors that are rejected up front without touching any state.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning
                | Self::RestoreInProgress
                | Self::NotFound(_)
                | Self::InvalidState(_)
                | Self::ConfigInvalid(_)
        )
    }
}
