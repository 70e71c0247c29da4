use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Mesh-network control plane configuration.
#[derive(Clone)]
pub struct MeshConfig {
    pub api_base: String,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<SecretString>,
    /// Tailnet name; `-` means the tailnet owning the OAuth client.
    pub tailnet: String,
    /// ACL tag applied to every VM that joins.
    pub tag: String,
    /// Lifetime of minted join keys.
    pub key_expiry: Duration,
    /// Device-list polls while waiting for a new VM to join.
    pub join_attempts: u32,
    pub join_delay: Duration,
}

impl std::fmt::Debug for MeshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshConfig")
            .field("api_base", &self.api_base)
            .field("oauth_client_id", &self.oauth_client_id)
            .field("oauth_client_secret", &self.oauth_client_secret.is_some())
            .field("tailnet", &self.tailnet)
            .field("tag", &self.tag)
            .field("key_expiry", &self.key_expiry)
            .field("join_attempts", &self.join_attempts)
            .field("join_delay", &self.join_delay)
            .finish()
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.tailscale.com".to_string(),
            oauth_client_id: None,
            oauth_client_secret: None,
            tailnet: "-".to_string(),
            tag: "tag:infra-vm".to_string(),
            key_expiry: Duration::from_secs(3600),
            join_attempts: 30,
            join_delay: Duration::from_secs(10),
        }
    }
}

impl MeshConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let tag = optional_env("MESH_TAG")?.unwrap_or(defaults.tag);
        if !tag.starts_with("tag:") {
            return Err(ConfigError::InvalidValue {
                key: "MESH_TAG".to_string(),
                message: "must start with 'tag:'".to_string(),
            });
        }

        Ok(Self {
            api_base: optional_env("MESH_API_BASE")?
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            oauth_client_id: optional_env("MESH_OAUTH_CLIENT_ID")?,
            oauth_client_secret: optional_env("MESH_OAUTH_CLIENT_SECRET")?.map(SecretString::from),
            tailnet: optional_env("MESH_TAILNET")?.unwrap_or(defaults.tailnet),
            tag,
            key_expiry: Duration::from_secs(parse_optional_env(
                "MESH_KEY_EXPIRY_SECS",
                defaults.key_expiry.as_secs(),
            )?),
            join_attempts: parse_optional_env("MESH_JOIN_ATTEMPTS", defaults.join_attempts)?,
            join_delay: Duration::from_secs(parse_optional_env(
                "MESH_JOIN_DELAY_SECS",
                defaults.join_delay.as_secs(),
            )?),
        })
    }

    /// Whether OAuth client credentials are present.
    pub fn has_credentials(&self) -> bool {
        self.oauth_client_id.is_some() && self.oauth_client_secret.is_some()
    }
}
