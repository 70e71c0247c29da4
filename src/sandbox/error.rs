//! Error types for local sandboxes.

use thiserror::Error;
use uuid::Uuid;

use crate::error::StoreError;
use crate::lifecycle::LifecycleError;
use crate::runtime::RuntimeError;

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Exec and file access need a running container.
    #[error("Sandbox {id} is {state}, not running")]
    NotRunning { id: Uuid, state: String },

    /// File paths must be absolute and name a file.
    #[error("Invalid sandbox path '{path}'")]
    InvalidPath { path: String },
}
