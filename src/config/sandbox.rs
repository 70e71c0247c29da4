use crate::config::helpers::optional_env;
use crate::error::ConfigError;

/// Local sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image used when a sandbox does not name one.
    pub default_image: String,
    /// Prefix for container/network names and ownership labels.
    pub name_prefix: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_image: "ubuntu:24.04".to_string(),
            name_prefix: "sandbox".to_string(),
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            default_image: optional_env("SANDBOX_IMAGE")?.unwrap_or(defaults.default_image),
            name_prefix: optional_env("SANDBOX_NAME_PREFIX")?.unwrap_or(defaults.name_prefix),
        })
    }
}
