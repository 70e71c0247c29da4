//! Reverse-proxy route commands.

use std::sync::Arc;

use clap::Subcommand;

use crate::config::Config;
use crate::proxy::{CaddyAdminClient, ProxyConfigManager, ProxyRoute};

#[derive(Subcommand, Debug, Clone)]
pub enum ProxyCommand {
    /// List routes
    Routes,

    /// Add or replace the route for a domain
    Add {
        #[arg(long)]
        domain: String,

        /// host:port to forward to
        #[arg(long)]
        upstream: String,

        /// Issue the certificate through a DNS challenge (needs PROXY_DNS_PROJECT)
        #[arg(long)]
        dns: bool,
    },

    /// Remove the route for a domain
    Remove {
        #[arg(long)]
        domain: String,
    },
}

pub async fn run_proxy_command(config: &Config, host: &str, cmd: ProxyCommand) -> anyhow::Result<()> {
    let admin = Arc::new(CaddyAdminClient::new(&config.proxy));

    match cmd {
        ProxyCommand::Routes => {
            let routes = ProxyConfigManager::new(admin, None).list_routes(host).await?;
            if routes.is_empty() {
                println!("No routes on {}", host);
            }
            for route in routes {
                println!("{} -> {}", route.domain, route.upstream);
            }
        }
        ProxyCommand::Add {
            domain,
            upstream,
            dns,
        } => {
            let challenge = if dns {
                Some(config.proxy.dns_automation().ok_or_else(|| {
                    anyhow::anyhow!("--dns needs PROXY_DNS_PROJECT to be set")
                })?)
            } else {
                None
            };
            let route = ProxyRoute::new(domain, upstream)?;
            ProxyConfigManager::new(admin, challenge)
                .add_route(host, &route)
                .await?;
            println!("{} -> {}", route.domain, route.upstream);
        }
        ProxyCommand::Remove { domain } => {
            ProxyConfigManager::new(admin, None)
                .remove_route(host, &domain)
                .await?;
            println!("Removed {}", domain);
        }
    }
    Ok(())
}
