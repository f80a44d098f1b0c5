//! Error types for snapcheck-core.

use thiserror::Error;

/// Result type alias for snapcheck-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while building instances or snapshots.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from snapcheck-vm, including monitor rejections
    #[error("VM error: {0}")]
    Vm(#[from] snapcheck_vm::VmError),

    /// The target snapshot version cannot carry the current device set
    #[error("snapshot version {version} rejected: {reason}")]
    CompatibilityRejected {
        /// Requested snapshot format version
        version: String,
        /// Devices attached when the snapshot was requested
        devices: usize,
        /// Why the version was rejected
        reason: String,
    },

    /// A diff snapshot was requested without dirty page tracking
    #[error("diff snapshot of {vm_id} requested but dirty page tracking is disabled")]
    DiffSnapshotsDisabled {
        /// Instance the snapshot was requested for
        vm_id: uuid::Uuid,
    },

    /// An artifact could not be used
    #[error("invalid artifact {path}: {reason}")]
    InvalidArtifact {
        /// Local path of the artifact
        path: String,
        /// What is wrong with it
        reason: String,
    },

    /// No disk was given; the first disk is the root device
    #[error("at least one disk (the root device) is required")]
    NoDisks,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// HTTP status reported by the monitor, if the monitor caused this error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Vm(e) => e.status(),
            _ => None,
        }
    }
}
