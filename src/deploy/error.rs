//! Error types for the deploy orchestrator.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::error::StoreError;
use crate::lifecycle::LifecycleError;
use crate::proxy::ProxyError;
use crate::runtime::RuntimeError;

/// Result type for deploy operations.
pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// `deploy` was called before an image was built.
    #[error("Deployment {id} has no built image; run a build first")]
    MissingImage { id: Uuid },

    /// The target VM is not running or has no mesh address.
    #[error("VM {vm_id} is not ready for deployments: {reason}")]
    VmNotReady { vm_id: Uuid, reason: String },

    /// Every port in the range is claimed on this VM.
    #[error("No free port in {start}-{end} on VM {vm_id}")]
    NoFreePort { vm_id: Uuid, start: u16, end: u16 },

    /// The database never answered its readiness probe.
    #[error("Database container {name} not ready after {attempts} attempts ({delay:?} apart)")]
    DbNotReady {
        name: String,
        attempts: u32,
        delay: Duration,
    },
}
