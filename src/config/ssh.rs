use std::time::Duration;

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

/// Remote shell configuration.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Login user on provisioned hosts. Also used for the `ssh-keys` metadata entry.
    pub user: String,
    pub port: u16,
    /// Connection setup budget. Exceeding it yields an "unreachable" error.
    pub connect_timeout: Duration,
    /// Default per-command timeout.
    pub command_timeout: Duration,
    /// Refuse hosts whose key differs from the pinned fingerprint.
    pub strict_host_keys: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "infra".to_string(),
            port: 22,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
            strict_host_keys: true,
        }
    }
}

impl SshConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            user: optional_env("SSH_USER")?.unwrap_or(defaults.user),
            port: parse_optional_env("SSH_PORT", defaults.port)?,
            connect_timeout: Duration::from_secs(parse_optional_env(
                "SSH_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
            command_timeout: Duration::from_secs(parse_optional_env(
                "SSH_COMMAND_TIMEOUT_SECS",
                defaults.command_timeout.as_secs(),
            )?),
            strict_host_keys: parse_bool_env("SSH_STRICT_HOST_KEYS", defaults.strict_host_keys)?,
        })
    }
}
