//! Operator CLI.
//!
//! Provides subcommands for:
//! - Generating instance key pairs (`keygen`)
//! - Running a command on a host over the remote shell (`ssh`)
//! - Talking to a container engine (`runtime ping`, `runtime df`, `runtime prune`)
//! - Editing a host's reverse-proxy routes (`proxy routes`, `proxy add`, `proxy remove`)
//! - Running a maintenance operation against a host (`maintenance`)

mod host;
mod proxy;
mod runtime;

pub use host::{run_keygen_command, run_maintenance_command, run_ssh_command};
pub use proxy::{ProxyCommand, run_proxy_command};
pub use runtime::{RuntimeCommand, run_runtime_command};

use std::path::PathBuf;

use clap::{ColorChoice, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "infracore")]
#[command(about = "Provision, deploy and tear down sandboxes, cloud VMs and deployments")]
#[command(
    long_about = "infracore drives containers, cloud VMs and reverse-proxy routes. Use 'infracore <subcommand> --help' for details.\nExamples:\n  infracore runtime ping  # Check the local engine\n  infracore proxy --host 100.64.0.7 routes  # List routes on a VM"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate an ed25519 key pair
    #[command(
        about = "Generate an SSH key pair",
        long_about = "Prints the public key line followed by the OpenSSH private key.\nExample: infracore keygen --comment infra@vm-1"
    )]
    Keygen {
        /// Comment embedded in both keys
        #[arg(long, default_value = "infracore")]
        comment: String,
    },

    /// Run a command on a host
    #[command(
        about = "Run a remote command",
        long_about = "Connects over SSH with the given private key and runs one command.\nExample: infracore ssh --host 100.64.0.7 --key-file vm.key -- uptime"
    )]
    Ssh {
        #[arg(long)]
        host: String,

        /// OpenSSH private key file
        #[arg(long)]
        key_file: PathBuf,

        /// Login user (defaults to SSH_USER)
        #[arg(long)]
        user: Option<String>,

        /// Command timeout in seconds (defaults to SSH_COMMAND_TIMEOUT_SECS)
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Talk to a container engine
    #[command(
        about = "Container engine commands",
        long_about = "Ping, report disk usage or prune a container engine. Without --host the local socket is used.\nExample: infracore runtime --host 100.64.0.7 df"
    )]
    Runtime {
        /// Remote engine host (port from DOCKER_REMOTE_PORT)
        #[arg(long)]
        host: Option<String>,

        #[command(subcommand)]
        command: RuntimeCommand,
    },

    /// Edit reverse-proxy routes on a host
    #[command(
        about = "Reverse-proxy routes",
        long_about = "List, add or remove routes in a host's proxy document.\nExample: infracore proxy --host 100.64.0.7 add --domain app.example.com --upstream 127.0.0.1:10000"
    )]
    Proxy {
        #[arg(long)]
        host: String,

        #[command(subcommand)]
        command: ProxyCommand,
    },

    /// Run a maintenance operation on a host
    #[command(
        about = "Run a maintenance operation",
        long_about = "Takes a JSON operation tagged by kind. Unknown kinds are rejected.\nExample: infracore maintenance --host 100.64.0.7 --key-file vm.key '{\"kind\":\"prune_images\",\"all\":true}'"
    )]
    Maintenance {
        #[arg(long)]
        host: String,

        /// OpenSSH private key file, needed by host-level operations
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Operation, e.g. {"kind":"restart_proxy"}
        op: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_version() {
        let cmd = Cli::command();
        assert_eq!(
            cmd.get_version().unwrap_or("unknown"),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ssh_takes_trailing_command() {
        let cli = Cli::try_parse_from([
            "infracore",
            "ssh",
            "--host",
            "10.0.0.1",
            "--key-file",
            "k",
            "--",
            "ls",
            "-la",
        ])
        .unwrap();
        match cli.command {
            Command::Ssh { command, .. } => assert_eq!(command, vec!["ls", "-la"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_runtime_host_is_optional() {
        let cli = Cli::try_parse_from(["infracore", "runtime", "ping"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Runtime {
                host: None,
                command: RuntimeCommand::Ping
            }
        ));
    }
}
