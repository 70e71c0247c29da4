use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;

use crate::config::SshConfig;
use crate::keys::KeyPair;
use crate::ssh::{
    CommandOutput, HostKeyPolicy, RemoteShell, Result, SequenceOutput, ShellError, ShellTarget,
};

/// Extended-data stream number for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

#[derive(Default)]
struct Observed {
    fingerprint: Option<String>,
    mismatch: bool,
}

/// Client handler that applies the host-key policy.
struct HostKeyCheck {
    policy: HostKeyPolicy,
    observed: Arc<Mutex<Observed>>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = format!("SHA256:{}", server_public_key.fingerprint());
        let accepted = match &self.policy {
            HostKeyPolicy::AcceptAny => true,
            HostKeyPolicy::Pinned(expected) => *expected == fingerprint,
        };
        if let Ok(mut observed) = self.observed.lock() {
            observed.mismatch = !accepted;
            observed.fingerprint = Some(fingerprint);
        }
        Ok(accepted)
    }
}

struct Session {
    handle: Handle<HostKeyCheck>,
    fingerprint: Option<String>,
}

impl Session {
    async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("SSH disconnect failed: {}", e);
        }
    }
}

/// [`RemoteShell`] over SSH.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
        }
    }

    async fn connect(&self, target: &ShellTarget, key: &KeyPair) -> Result<Session> {
        let observed = Arc::new(Mutex::new(Observed::default()));
        let handler = HostKeyCheck {
            policy: target.host_key.clone(),
            observed: Arc::clone(&observed),
        };
        let config = Arc::new(client::Config::default());
        let addr = (target.host.clone(), target.port);

        let unreachable = |reason: String| ShellError::Unreachable {
            host: target.host.clone(),
            reason,
        };

        let connected = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, addr, handler),
        )
        .await
        .map_err(|_| unreachable(format!("no handshake within {:?}", self.connect_timeout)))?;

        let (fingerprint, mismatch) = observed
            .lock()
            .map(|o| (o.fingerprint.clone(), o.mismatch))
            .unwrap_or((None, false));

        let mut handle = match connected {
            Ok(handle) => handle,
            Err(_) if mismatch => {
                let expected = match &target.host_key {
                    HostKeyPolicy::Pinned(fp) => fp.clone(),
                    HostKeyPolicy::AcceptAny => String::new(),
                };
                return Err(ShellError::HostKeyMismatch {
                    host: target.host.clone(),
                    expected,
                    actual: fingerprint.unwrap_or_default(),
                });
            }
            Err(e) => return Err(unreachable(e.to_string())),
        };

        let signing = russh_keys::key::KeyPair::Ed25519(key.signing_key().clone());
        let authenticated = tokio::time::timeout(
            self.connect_timeout,
            handle.authenticate_publickey(target.user.clone(), Arc::new(signing)),
        )
        .await
        .map_err(|_| unreachable("authentication stalled".to_string()))?
        .map_err(|e| ShellError::Session {
            reason: e.to_string(),
        })?;

        if !authenticated {
            return Err(ShellError::AuthRejected {
                user: target.user.clone(),
                host: target.host.clone(),
            });
        }

        tracing::debug!(host = %target.host, "SSH session established");
        Ok(Session {
            handle,
            fingerprint,
        })
    }

    /// Run one command on an open session, collecting both output streams.
    async fn exec(session: &Session, command: &str) -> Result<CommandOutput> {
        let session_err = |e: russh::Error| ShellError::Session {
            reason: e.to_string(),
        };

        let mut channel = session
            .handle
            .channel_open_session()
            .await
            .map_err(session_err)?;
        channel.exec(true, command).await.map_err(session_err)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(CommandOutput {
            // Killed by a signal or closed without a status.
            exit_code: exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            host_key_fingerprint: session.fingerprint.clone(),
        })
    }

    async fn exec_with_timeout(
        session: &Session,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        match tokio::time::timeout(timeout, Self::exec(session, command)).await {
            Ok(result) => result,
            Err(_) => Err(ShellError::Timeout {
                command: command.to_string(),
                after: timeout,
            }),
        }
    }
}

#[async_trait]
impl RemoteShell for SshExecutor {
    async fn run_command(
        &self,
        target: &ShellTarget,
        key: &KeyPair,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let session = self.connect(target, key).await?;
        let result = Self::exec_with_timeout(&session, command, timeout).await;
        // Also forces the channel closed after a timeout.
        session.close().await;

        if let Ok(output) = &result {
            tracing::debug!(
                host = %target.host,
                exit_code = output.exit_code,
                "Remote command finished"
            );
        }
        result
    }

    async fn run_commands(
        &self,
        target: &ShellTarget,
        key: &KeyPair,
        commands: &[String],
        timeout: Duration,
    ) -> Result<SequenceOutput> {
        let session = self.connect(target, key).await?;
        let mut seq = SequenceOutput::default();

        for (i, command) in commands.iter().enumerate() {
            let output = match Self::exec_with_timeout(&session, command, timeout).await {
                Ok(output) => output,
                Err(e) => {
                    session.close().await;
                    return Err(e);
                }
            };
            let ok = output.success();
            seq.outputs.push(output);
            if !ok {
                tracing::info!(host = %target.host, index = i, "Remote command sequence stopped");
                seq.failed = Some(i);
                break;
            }
        }

        session.close().await;
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let executor = SshExecutor::new(&SshConfig {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let target = ShellTarget::new("127.0.0.1", port, "infra");
        let key = KeyPair::generate("test");
        let err = executor
            .run_command(&target, &key, "true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unreachable(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_silent_listener_times_out_as_unreachable() {
        // Accepts TCP but never speaks SSH.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _accept = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let executor = SshExecutor::new(&SshConfig {
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        let target = ShellTarget::new("127.0.0.1", port, "infra");
        let err = executor
            .run_command(&target, &KeyPair::generate("t"), "true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unreachable(), "got {err:?}");
    }
}
