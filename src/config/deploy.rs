use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Deploy orchestrator configuration.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// First host port handed out to deployments on a VM.
    pub port_range_start: u16,
    /// Last host port (inclusive).
    pub port_range_end: u16,
    /// Database image run next to every application.
    pub db_image: String,
    /// Port the application listens on inside its container.
    pub app_port: u16,
    pub db_ready_attempts: u32,
    pub db_ready_delay: Duration,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            port_range_start: 10000,
            port_range_end: 10999,
            db_image: "postgres:16-alpine".to_string(),
            app_port: 8080,
            db_ready_attempts: 30,
            db_ready_delay: Duration::from_secs(2),
        }
    }
}

impl DeployConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port_range_start =
            parse_optional_env("DEPLOY_PORT_RANGE_START", defaults.port_range_start)?;
        let port_range_end = parse_optional_env("DEPLOY_PORT_RANGE_END", defaults.port_range_end)?;
        if port_range_start > port_range_end {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOY_PORT_RANGE_END".to_string(),
                message: format!(
                    "must be >= DEPLOY_PORT_RANGE_START ({port_range_start}), got {port_range_end}"
                ),
            });
        }

        Ok(Self {
            port_range_start,
            port_range_end,
            db_image: optional_env("DEPLOY_DB_IMAGE")?.unwrap_or(defaults.db_image),
            app_port: parse_optional_env("DEPLOY_APP_PORT", defaults.app_port)?,
            db_ready_attempts: parse_optional_env(
                "DEPLOY_DB_READY_ATTEMPTS",
                defaults.db_ready_attempts,
            )?,
            db_ready_delay: Duration::from_secs(parse_optional_env(
                "DEPLOY_DB_READY_DELAY_SECS",
                defaults.db_ready_delay.as_secs(),
            )?),
        })
    }
}
