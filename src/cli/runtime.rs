//! Container engine commands.

use clap::Subcommand;

use crate::config::Config;
use crate::runtime::{ContainerRuntime, DockerClient, RuntimeTarget};

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCommand {
    /// Check that the engine answers
    Ping,

    /// Show disk usage
    Df,

    /// Remove stopped containers and unused images
    Prune {
        /// Remove every unused image, not only dangling ones
        #[arg(long)]
        all: bool,
    },
}

pub async fn run_runtime_command(
    config: &Config,
    host: Option<String>,
    cmd: RuntimeCommand,
) -> anyhow::Result<()> {
    let target = match host {
        Some(host) => RuntimeTarget::remote(host, &config.runtime),
        None => RuntimeTarget::local(&config.runtime),
    };
    let client = DockerClient::new(target.clone(), &config.runtime);

    match cmd {
        RuntimeCommand::Ping => {
            client.ping().await?;
            println!("{} is up", target);
        }
        RuntimeCommand::Df => {
            println!("{}", client.disk_usage().await?);
        }
        RuntimeCommand::Prune { all } => {
            let containers = client.prune_containers().await?;
            let images = client.prune_images(all).await?;
            println!(
                "Removed {} containers and {} images, reclaimed {} bytes",
                containers.deleted,
                images.deleted,
                containers.space_reclaimed + images.space_reclaimed
            );
        }
    }
    Ok(())
}
