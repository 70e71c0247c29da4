use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Container runtime (Docker engine API) configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Local control socket used for sandboxes and local builds.
    pub socket_path: PathBuf,
    /// Versioned path prefix, e.g. `v1.43`.
    pub api_version: String,
    /// Port the remote engines listen on (mesh-only).
    pub remote_port: u16,
    /// Upper bound for a single non-streaming request.
    pub request_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/docker.sock"),
            api_version: "v1.43".to_string(),
            remote_port: 2375,
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl RuntimeConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_version = optional_env("DOCKER_API_VERSION")?
            .map(|v| {
                if v.starts_with('v') {
                    v
                } else {
                    format!("v{v}")
                }
            })
            .unwrap_or(defaults.api_version);

        Ok(Self {
            socket_path: optional_env("DOCKER_SOCKET")?
                .map(|s| PathBuf::from(s.trim_start_matches("unix://")))
                .unwrap_or(defaults.socket_path),
            api_version,
            remote_port: parse_optional_env("DOCKER_REMOTE_PORT", defaults.remote_port)?,
            request_timeout: Duration::from_secs(parse_optional_env(
                "DOCKER_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
        })
    }
}
