//! infracore operator entry point.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use infracore::{
    cli::{
        Cli, Command, run_keygen_command, run_maintenance_command, run_proxy_command,
        run_runtime_command, run_ssh_command,
    },
    config::Config,
};

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("infracore=info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    let _ = dotenvy::dotenv();
    init_tracing(cli.json_logs);

    let config = Config::from_env()?;

    match cli.command {
        Command::Keygen { comment } => run_keygen_command(&comment),
        Command::Ssh {
            host,
            key_file,
            user,
            timeout,
            command,
        } => {
            let code =
                run_ssh_command(&config, &host, &key_file, user.as_deref(), timeout, &command)
                    .await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Runtime { host, command } => run_runtime_command(&config, host, command).await,
        Command::Proxy { host, command } => run_proxy_command(&config, &host, command).await,
        Command::Maintenance { host, key_file, op } => {
            run_maintenance_command(&config, &host, key_file.as_deref(), &op).await
        }
    }
}
