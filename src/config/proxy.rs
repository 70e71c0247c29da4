use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Reverse-proxy admin API configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Admin API port on each VM.
    pub admin_port: u16,
    /// DNS provider module used for DNS-01 challenges.
    pub dns_provider: String,
    /// Cloud project owning the DNS zones. `None` disables DNS automation.
    pub dns_project: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_port: 2019,
            dns_provider: "googleclouddns".to_string(),
            dns_project: None,
        }
    }
}

impl ProxyConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            admin_port: parse_optional_env("PROXY_ADMIN_PORT", defaults.admin_port)?,
            dns_provider: optional_env("PROXY_DNS_PROVIDER")?.unwrap_or(defaults.dns_provider),
            dns_project: optional_env("PROXY_DNS_PROJECT")?,
        })
    }

    /// DNS automation options for new routes, when a DNS project is configured.
    pub fn dns_automation(&self) -> Option<crate::proxy::DnsChallenge> {
        self.dns_project
            .as_ref()
            .map(|project| crate::proxy::DnsChallenge {
                provider: self.dns_provider.clone(),
                project: project.clone(),
            })
    }
}
