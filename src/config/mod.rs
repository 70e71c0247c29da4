//! Configuration for infracore.
//!
//! Settings are loaded with priority: env var > default. The binary loads a
//! `.env` file through `dotenvy` before calling [`Config::from_env`].

mod cloud;
mod deploy;
pub(crate) mod helpers;
mod mesh;
mod proxy;
mod runtime;
mod sandbox;
mod ssh;

pub use self::cloud::CloudConfig;
pub use self::deploy::DeployConfig;
pub use self::mesh::MeshConfig;
pub use self::proxy::ProxyConfig;
pub use self::runtime::RuntimeConfig;
pub use self::sandbox::SandboxConfig;
pub use self::ssh::SshConfig;

use crate::error::ConfigError;

/// Main configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub cloud: CloudConfig,
    pub mesh: MeshConfig,
    pub deploy: DeployConfig,
    pub proxy: ProxyConfig,
    pub ssh: SshConfig,
    pub sandbox: SandboxConfig,
}

impl Config {
    /// Resolve every section from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            runtime: RuntimeConfig::resolve()?,
            cloud: CloudConfig::resolve()?,
            mesh: MeshConfig::resolve()?,
            deploy: DeployConfig::resolve()?,
            proxy: ProxyConfig::resolve()?,
            ssh: SshConfig::resolve()?,
            sandbox: SandboxConfig::resolve()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = Config::default();
        assert!(config.deploy.port_range_start <= config.deploy.port_range_end);
        assert_eq!(config.runtime.remote_port, 2375);
        assert_eq!(config.proxy.admin_port, 2019);
        assert!(config.mesh.tag.starts_with("tag:"));
        assert_eq!(config.cloud.region(), "us-central1");
    }
}
