//! Remote shell executor.
//!
//! Runs commands on provisioned hosts over SSH with public-key auth. Each
//! call opens its own session; `run_commands` reuses one session for the
//! whole sequence.

mod error;
mod executor;

use std::time::Duration;

use async_trait::async_trait;

pub use error::{Result, ShellError};
pub use executor::SshExecutor;

use crate::keys::KeyPair;

/// How to treat the server's host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept whatever the host presents. Used on first contact; the
    /// observed fingerprint is returned so the caller can pin it.
    AcceptAny,
    /// Refuse the host unless its key has this SHA-256 fingerprint.
    Pinned(String),
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ShellTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub host_key: HostKeyPolicy,
}

impl ShellTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            host_key: HostKeyPolicy::AcceptAny,
        }
    }

    pub fn with_host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }
}

/// Output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Fingerprint of the host key the session was established with.
    pub host_key_fingerprint: Option<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Result of a command sequence that stops at the first failure.
#[derive(Debug, Clone, Default)]
pub struct SequenceOutput {
    /// Outputs of every command that ran, in order.
    pub outputs: Vec<CommandOutput>,
    /// Index of the command that exited non-zero, if any.
    pub failed: Option<usize>,
}

impl SequenceOutput {
    pub fn success(&self) -> bool {
        self.failed.is_none()
    }

    /// The failing command's index and output.
    pub fn failure(&self) -> Option<(usize, &CommandOutput)> {
        self.failed.and_then(|i| self.outputs.get(i).map(|o| (i, o)))
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a single command and collect its exit code and output.
    async fn run_command(
        &self,
        target: &ShellTarget,
        key: &KeyPair,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Run commands in order, stopping at the first non-zero exit.
    ///
    /// The default opens one session per command.
    async fn run_commands(
        &self,
        target: &ShellTarget,
        key: &KeyPair,
        commands: &[String],
        timeout: Duration,
    ) -> Result<SequenceOutput> {
        let mut seq = SequenceOutput::default();
        for (i, command) in commands.iter().enumerate() {
            let output = self.run_command(target, key, command, timeout).await?;
            let ok = output.success();
            seq.outputs.push(output);
            if !ok {
                seq.failed = Some(i);
                break;
            }
        }
        Ok(seq)
    }
}
