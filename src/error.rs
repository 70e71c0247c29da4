//! Error types for infracore.
//!
//! Each subsystem owns its error enum (see `runtime::error`, `ssh::error`,
//! ...). This module holds the crate-wide aggregate plus the errors shared by
//! configuration and persistence.

use uuid::Uuid;

pub use crate::cloud::CloudError;
pub use crate::deploy::DeployError;
pub use crate::keys::KeyError;
pub use crate::maintenance::MaintenanceError;
pub use crate::mesh::MeshError;
pub use crate::proxy::ProxyError;
pub use crate::runtime::RuntimeError;
pub use crate::sandbox::SandboxError;
pub use crate::ssh::ShellError;
pub use crate::vm::ProvisionError;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Remote shell error: {0}")]
    Shell(#[from] ShellError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Deploy error: {0}")]
    Deploy(#[from] DeployError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Maintenance error: {0}")]
    Maintenance(#[from] MaintenanceError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors raised by an [`InfraStore`](crate::store::InfraStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Result type using the top-level error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_display() {
        let id = Uuid::nil();
        let err = StoreError::NotFound {
            entity: "deployment",
            id,
        };
        assert_eq!(
            err.to_string(),
            "deployment 00000000-0000-0000-0000-000000000000 not found"
        );
    }

    #[test]
    fn test_config_error_wraps_into_top_level() {
        let err: Error = ConfigError::InvalidValue {
            key: "SSH_PORT".to_string(),
            message: "must be a number".to_string(),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("Configuration error"));
        assert!(msg.contains("SSH_PORT"));
    }
}
