//! Error types for the garbage collector

use camino::Utf8PathBuf;

use crate::digest::{Digest, InvalidDigest};
use crate::manifest::InvalidManifest;

/// Result type for garbage collection operations
pub type GcResult<T> = Result<T, GcError>;

/// Error types for garbage collection operations
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// Another garbage collection run holds the lock
    #[error("lock held by another garbage collection run")]
    LockHeld,

    /// The lock was lost while the run was in progress
    #[error("garbage collection lock lost during the run")]
    LockLost,

    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// Manifest not found
    #[error("manifest not found: {repository}/{digest}")]
    ManifestNotFound {
        /// Repository name
        repository: String,
        /// Manifest digest
        digest: Digest,
    },

    /// Invalid digest format
    #[error(transparent)]
    InvalidDigest(#[from] InvalidDigest),

    /// Invalid manifest content
    #[error(transparent)]
    InvalidManifest(#[from] InvalidManifest),

    /// Digest mismatch on content verification
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: Digest,
        /// Actual digest
        actual: Digest,
    },

    /// No checkpoint present at the given location
    #[error("checkpoint not found in {0}")]
    CheckpointMissing(Utf8PathBuf),

    /// Checkpoint could not be deserialized
    #[error("checkpoint is malformed: {0}")]
    CheckpointMalformed(String),

    /// Checkpoint was written by an incompatible schema version
    #[error("checkpoint schema version {found} is not supported (expected {expected})")]
    CheckpointVersion {
        /// The supported schema version
        expected: u32,
        /// The version found on disk
        found: u32,
    },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GcError {
    /// Process exit code for this error.
    ///
    /// Lock contention gets a distinct code so that schedulers can tell
    /// "another run is active" apart from genuine failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            GcError::LockHeld => 2,
            _ => 1,
        }
    }
}
