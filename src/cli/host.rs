//! Key generation, remote commands and host maintenance.

use std::path::Path;
use std::time::Duration;

use secrecy::ExposeSecret;

use crate::config::Config;
use crate::keys::KeyPair;
use crate::maintenance::{MaintenanceOp, run_on_engine};
use crate::runtime::{DockerClient, RuntimeTarget};
use crate::ssh::{RemoteShell, ShellTarget, SshExecutor};

pub fn run_keygen_command(comment: &str) -> anyhow::Result<()> {
    let pair = KeyPair::generate(comment);
    println!("{}", pair.public_key_text());
    print!("{}", pair.private_key_text().expose_secret());
    Ok(())
}

fn load_key(path: &Path) -> anyhow::Result<KeyPair> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read key file {}: {}", path.display(), e))?;
    Ok(KeyPair::decode(&text)?)
}

pub async fn run_ssh_command(
    config: &Config,
    host: &str,
    key_file: &Path,
    user: Option<&str>,
    timeout: Option<u64>,
    command: &[String],
) -> anyhow::Result<i32> {
    let key = load_key(key_file)?;
    let user = user.unwrap_or(&config.ssh.user);
    let target = ShellTarget::new(host, config.ssh.port, user);
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or(config.ssh.command_timeout);

    let output = SshExecutor::new(&config.ssh)
        .run_command(&target, &key, &command.join(" "), timeout)
        .await?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    if let Some(fp) = &output.host_key_fingerprint {
        tracing::info!(host, fingerprint = %fp, "Host key");
    }
    Ok(output.exit_code)
}

pub async fn run_maintenance_command(
    config: &Config,
    host: &str,
    key_file: Option<&Path>,
    op: &str,
) -> anyhow::Result<()> {
    let op: MaintenanceOp = serde_json::from_str(op)
        .map_err(|e| anyhow::anyhow!("Invalid maintenance operation: {}", e))?;

    let client = DockerClient::new(RuntimeTarget::remote(host, &config.runtime), &config.runtime);
    if let Some(outcome) = run_on_engine(&client, &op).await? {
        println!("{}", outcome);
        return Ok(());
    }

    let key_file = key_file
        .ok_or_else(|| anyhow::anyhow!("{:?} runs over SSH and needs --key-file", op))?;
    let key = load_key(key_file)?;
    let target = ShellTarget::new(host, config.ssh.port, &config.ssh.user);
    let commands: Vec<String> = op.shell_commands().iter().map(|c| c.to_string()).collect();

    let seq = SshExecutor::new(&config.ssh)
        .run_commands(&target, &key, &commands, config.ssh.command_timeout)
        .await?;
    if let Some((i, output)) = seq.failure() {
        anyhow::bail!(
            "'{}' exited with {}: {}",
            commands[i],
            output.exit_code,
            output.stderr.trim()
        );
    }
    println!("ran {} command(s)", seq.outputs.len());
    Ok(())
}
