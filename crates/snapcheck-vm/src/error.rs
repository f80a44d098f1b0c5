//! Error types for snapcheck-vm.

use thiserror::Error;

/// Result type alias for snapcheck-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while preparing or driving a microVM.
#[derive(Debug, Error)]
pub enum VmError {
    /// The monitor answered a request with something other than 204 No Content.
    ///
    /// The body is the monitor's own error text, kept verbatim.
    #[error("{operation} rejected with status {status}: {body}")]
    ConfigurationRejected {
        /// Request that was rejected, e.g. `PUT /machine-config`
        operation: String,
        /// HTTP status returned by the monitor
        status: u16,
        /// Response body returned by the monitor
        body: String,
    },

    /// A host-level resource (directory, link, fifo, tap) could not be created.
    #[error("failed to allocate {what}: {source}")]
    ResourceAllocation {
        /// Human readable description of the resource
        what: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// VM is not in expected state
    #[error("invalid VM state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Failed to spawn the monitor process
    #[error("failed to spawn monitor: {0}")]
    Spawn(String),

    /// The control socket could not be reached or the exchange broke down
    #[error("control channel error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl VmError {
    /// Wrap an I/O error raised while allocating a host resource.
    pub fn allocation(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::ResourceAllocation {
            what: what.into(),
            source,
        }
    }

    /// HTTP status reported by the monitor, if this error came from it.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ConfigurationRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}
