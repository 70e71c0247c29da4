//! Error types for the container runtime client.

use std::time::Duration;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised while talking to a container engine.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Could not reach the engine (socket missing, connection refused, reset).
    #[error("Cannot connect to container engine at {target}: {reason}")]
    Connection { target: String, reason: String },

    /// A request or stream stalled past its budget.
    #[error("Container engine {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The engine answered with a non-success status.
    #[error("Container engine returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The addressed object does not exist.
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// A build/push/pull progress record carried an error.
    #[error("{message}")]
    Progress { message: String },

    /// The engine sent data we could not interpret.
    #[error("Malformed response from container engine: {reason}")]
    Protocol { reason: String },

    /// Building or reading a tar archive failed.
    #[error("Archive error: {0}")]
    Archive(#[from] std::io::Error),
}

impl RuntimeError {
    /// Whether this is the engine's "no such object" answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the failure happened before the engine produced an answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}
