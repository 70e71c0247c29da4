use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;

/// Cloud compute configuration.
#[derive(Clone)]
pub struct CloudConfig {
    /// Project that owns instances and addresses.
    pub project: Option<String>,
    pub zone: String,
    pub machine_type: String,
    pub source_image: String,
    pub disk_size_gb: u32,
    /// Compute API base URL (overridable for tests and emulators).
    pub api_base: String,
    /// Static bearer token. When unset, tokens come from the metadata server.
    pub access_token: Option<SecretString>,
    /// Delay between long-running operation polls.
    pub op_poll_interval: Duration,
    /// Maximum number of operation polls before giving up.
    pub op_max_polls: u32,
    /// Reserve a named static address before creating the instance.
    pub reserve_static_ip: bool,
    /// Prefix for deterministic instance and address names.
    pub name_prefix: String,
}

impl std::fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudConfig")
            .field("project", &self.project)
            .field("zone", &self.zone)
            .field("machine_type", &self.machine_type)
            .field("source_image", &self.source_image)
            .field("disk_size_gb", &self.disk_size_gb)
            .field("api_base", &self.api_base)
            .field("access_token", &self.access_token.is_some())
            .field("op_poll_interval", &self.op_poll_interval)
            .field("op_max_polls", &self.op_max_polls)
            .field("reserve_static_ip", &self.reserve_static_ip)
            .field("name_prefix", &self.name_prefix)
            .finish()
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            project: None,
            zone: "us-central1-a".to_string(),
            machine_type: "e2-medium".to_string(),
            source_image: "projects/debian-cloud/global/images/family/debian-12".to_string(),
            disk_size_gb: 30,
            api_base: "https://compute.googleapis.com/compute/v1".to_string(),
            access_token: None,
            op_poll_interval: Duration::from_secs(5),
            op_max_polls: 120,
            reserve_static_ip: true,
            name_prefix: "infra".to_string(),
        }
    }
}

impl CloudConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let name_prefix = optional_env("VM_NAME_PREFIX")?.unwrap_or(defaults.name_prefix);
        if !name_prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || !name_prefix.starts_with(|c: char| c.is_ascii_lowercase())
        {
            return Err(ConfigError::InvalidValue {
                key: "VM_NAME_PREFIX".to_string(),
                message: "must start with a lowercase letter and contain only [a-z0-9-]"
                    .to_string(),
            });
        }

        Ok(Self {
            project: optional_env("CLOUD_PROJECT")?,
            zone: optional_env("CLOUD_ZONE")?.unwrap_or(defaults.zone),
            machine_type: optional_env("CLOUD_MACHINE_TYPE")?.unwrap_or(defaults.machine_type),
            source_image: optional_env("CLOUD_SOURCE_IMAGE")?.unwrap_or(defaults.source_image),
            disk_size_gb: parse_optional_env("CLOUD_DISK_GB", defaults.disk_size_gb)?,
            api_base: optional_env("CLOUD_API_BASE")?
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            access_token: optional_env("CLOUD_ACCESS_TOKEN")?.map(SecretString::from),
            op_poll_interval: Duration::from_secs(parse_optional_env(
                "CLOUD_OP_POLL_SECS",
                defaults.op_poll_interval.as_secs(),
            )?),
            op_max_polls: parse_optional_env("CLOUD_OP_MAX_POLLS", defaults.op_max_polls)?,
            reserve_static_ip: parse_bool_env(
                "CLOUD_RESERVE_STATIC_IP",
                defaults.reserve_static_ip,
            )?,
            name_prefix,
        })
    }

    /// Region derived from the zone (`us-central1-a` -> `us-central1`).
    pub fn region(&self) -> &str {
        match self.zone.rfind('-') {
            Some(idx) => &self.zone[..idx],
            None => &self.zone,
        }
    }

    /// Project id, or a configuration error naming the missing variable.
    pub fn require_project(&self) -> Result<&str, ConfigError> {
        self.project
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "CLOUD_PROJECT".to_string(),
                hint: "set the cloud project that owns VM instances".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_from_zone() {
        let config = CloudConfig {
            zone: "europe-west4-b".to_string(),
            ..Default::default()
        };
        assert_eq!(config.region(), "europe-west4");
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = CloudConfig {
            access_token: Some(SecretString::from("ya29.secret")),
            ..Default::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("ya29"));
    }
}
