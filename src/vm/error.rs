//! VM provisioning errors.

use crate::cloud::CloudError;
use crate::error::{ConfigError, StoreError};
use crate::keys::KeyError;
use crate::lifecycle::LifecycleError;
use crate::mesh::MeshError;

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Static address {name} was reserved but has no IP")]
    AddressUnavailable { name: String },

    #[error("No private key stored for VM {name}")]
    MissingKey { name: String },

    #[error("VM {name} is not reachable over the mesh yet")]
    NotOnMesh { name: String },
}
