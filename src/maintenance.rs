//! Host maintenance operations.
//!
//! The set of operations is closed: callers submit a JSON document tagged
//! by `kind`, and anything not listed in [`MaintenanceOp`] fails to parse.
//! Engine housekeeping goes to the VM's container engine; service restarts
//! go over the remote shell and fall back to a hard reset through the cloud
//! API when the host cannot be reached.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{Config, RuntimeConfig, SshConfig};
use crate::error::StoreError;
use crate::lifecycle::{Journal, VmState};
use crate::model::{Resource, VmInstance};
use crate::runtime::{
    ContainerRuntime, DiskUsage, PruneReport, RuntimeConnector, RuntimeError, RuntimeTarget,
};
use crate::ssh::{RemoteShell, ShellError};
use crate::vm::{ProvisionError, VmProvisioner};

pub type Result<T> = std::result::Result<T, MaintenanceError>;

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("VM {name} is {state}; maintenance needs a running VM")]
    VmNotRunning { name: String, state: String },

    #[error("Command '{command}' exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

/// A maintenance request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaintenanceOp {
    /// Remove dangling images, or every unused image with `all`.
    PruneImages {
        #[serde(default)]
        all: bool,
    },
    PruneContainers,
    DiskUsage,
    RestartRuntime,
    RestartProxy,
    Reboot,
}

impl MaintenanceOp {
    /// Commands a host-level operation runs over the remote shell. Empty for
    /// operations handled by the container engine.
    pub fn shell_commands(&self) -> &'static [&'static str] {
        match self {
            Self::RestartRuntime => RESTART_RUNTIME,
            Self::RestartProxy => RESTART_PROXY,
            Self::Reboot => REBOOT,
            Self::PruneImages { .. } | Self::PruneContainers | Self::DiskUsage => &[],
        }
    }
}

/// Run an engine-level operation. `None` when `op` is host-level.
pub async fn run_on_engine(
    runtime: &dyn ContainerRuntime,
    op: &MaintenanceOp,
) -> Result<Option<MaintenanceOutcome>> {
    let outcome = match op {
        MaintenanceOp::PruneImages { all } => {
            MaintenanceOutcome::Pruned(runtime.prune_images(*all).await?)
        }
        MaintenanceOp::PruneContainers => {
            MaintenanceOutcome::Pruned(runtime.prune_containers().await?)
        }
        MaintenanceOp::DiskUsage => MaintenanceOutcome::DiskUsage(runtime.disk_usage().await?),
        MaintenanceOp::RestartRuntime | MaintenanceOp::RestartProxy | MaintenanceOp::Reboot => {
            return Ok(None);
        }
    };
    Ok(Some(outcome))
}

const RESTART_RUNTIME: &[&str] = &["sudo systemctl restart docker"];
const RESTART_PROXY: &[&str] = &["sudo systemctl restart caddy"];
// scheduled so the session can close cleanly first
const REBOOT: &[&str] = &["sudo systemd-run --on-active=2 systemctl reboot"];

/// Result of a maintenance operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    Pruned(PruneReport),
    DiskUsage(DiskUsage),
    /// Every shell command exited zero.
    Completed { commands: usize },
    /// The host was unreachable and was hard-reset instead.
    HardReset { reason: String },
}

impl fmt::Display for MaintenanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pruned(report) => write!(
                f,
                "removed {} objects, reclaimed {} bytes",
                report.deleted, report.space_reclaimed
            ),
            Self::DiskUsage(usage) => write!(f, "{}", usage),
            Self::Completed { commands } => write!(f, "ran {} command(s)", commands),
            Self::HardReset { reason } => write!(f, "host unreachable ({}); hard reset", reason),
        }
    }
}

pub struct MaintenanceRunner {
    connector: Arc<dyn RuntimeConnector>,
    shell: Arc<dyn RemoteShell>,
    provisioner: Arc<VmProvisioner>,
    journal: Journal,
    runtime: RuntimeConfig,
    ssh: SshConfig,
}

impl MaintenanceRunner {
    pub fn new(
        connector: Arc<dyn RuntimeConnector>,
        shell: Arc<dyn RemoteShell>,
        provisioner: Arc<VmProvisioner>,
        journal: Journal,
        config: &Config,
    ) -> Self {
        Self {
            connector,
            shell,
            provisioner,
            journal,
            runtime: config.runtime.clone(),
            ssh: config.ssh.clone(),
        }
    }

    pub async fn run(&self, vm_id: Uuid, op: &MaintenanceOp) -> Result<MaintenanceOutcome> {
        let mut vm = self.journal.store().get_vm(vm_id).await?;
        if vm.state() != VmState::Running {
            return Err(MaintenanceError::VmNotRunning {
                name: vm.name.clone(),
                state: vm.state().to_string(),
            });
        }
        self.journal.log(&vm, format!("Maintenance: {:?}", op));

        let runtime = self.runtime_for(&vm)?;
        let outcome = match run_on_engine(runtime.as_ref(), op).await? {
            Some(outcome) => outcome,
            None => self.run_on_host(&mut vm, op.shell_commands()).await?,
        };
        self.journal.log(&vm, outcome.to_string());
        Ok(outcome)
    }

    fn runtime_for(&self, vm: &VmInstance) -> Result<Arc<dyn ContainerRuntime>> {
        let host = vm
            .mesh_ip
            .clone()
            .ok_or_else(|| ProvisionError::NotOnMesh {
                name: vm.name.clone(),
            })?;
        Ok(self
            .connector
            .connect(&RuntimeTarget::remote(host, &self.runtime)))
    }

    async fn run_on_host(
        &self,
        vm: &mut VmInstance,
        commands: &[&str],
    ) -> Result<MaintenanceOutcome> {
        let (target, key) = self.provisioner.shell_access(vm)?;
        let commands: Vec<String> = commands.iter().map(|c| c.to_string()).collect();

        match self
            .shell
            .run_commands(&target, &key, &commands, self.ssh.command_timeout)
            .await
        {
            Ok(seq) => {
                if let Some(first) = seq.outputs.first() {
                    self.provisioner.record_host_key(vm, first).await?;
                }
                if let Some((i, output)) = seq.failure() {
                    return Err(MaintenanceError::CommandFailed {
                        command: commands[i].clone(),
                        exit_code: output.exit_code,
                        stderr: output.stderr.trim().to_string(),
                    });
                }
                Ok(MaintenanceOutcome::Completed {
                    commands: seq.outputs.len(),
                })
            }
            Err(e) if e.is_unreachable() => {
                tracing::warn!(vm = %vm.name, "Host unreachable, falling back to hard reset: {}", e);
                self.provisioner.reset(vm).await?;
                Ok(MaintenanceOutcome::HardReset {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InfraStore;
    use crate::testing::TestHarness;

    #[test]
    fn test_parse_known_and_unknown_kinds() {
        let op: MaintenanceOp = serde_json::from_str(r#"{"kind":"prune_images"}"#).unwrap();
        assert_eq!(op, MaintenanceOp::PruneImages { all: false });
        let op: MaintenanceOp =
            serde_json::from_str(r#"{"kind":"prune_images","all":true}"#).unwrap();
        assert_eq!(op, MaintenanceOp::PruneImages { all: true });
        let op: MaintenanceOp = serde_json::from_str(r#"{"kind":"reboot"}"#).unwrap();
        assert_eq!(op, MaintenanceOp::Reboot);

        assert!(serde_json::from_str::<MaintenanceOp>(r#"{"kind":"format_disk"}"#).is_err());
        assert!(serde_json::from_str::<MaintenanceOp>(r#"{"all":true}"#).is_err());
    }

    #[tokio::test]
    async fn test_prune_goes_to_vm_runtime() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;

        let outcome = h
            .maintenance
            .run(vm.id, &MaintenanceOp::PruneImages { all: true })
            .await
            .unwrap();
        assert!(matches!(outcome, MaintenanceOutcome::Pruned(_)));
        assert!(h.runtime.calls().contains(&"prune_images all=true".to_string()));
        assert!(
            h.connector
                .targets()
                .contains(&RuntimeTarget::remote(vm.mesh_ip.unwrap(), &h.config.runtime))
        );
    }

    #[tokio::test]
    async fn test_restart_runs_over_shell_and_pins_host_key() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;

        let outcome = h
            .maintenance
            .run(vm.id, &MaintenanceOp::RestartProxy)
            .await
            .unwrap();
        assert_eq!(outcome, MaintenanceOutcome::Completed { commands: 1 });
        assert_eq!(h.shell.commands(), vec!["sudo systemctl restart caddy".to_string()]);

        let saved = h.store.get_vm(vm.id).await.unwrap();
        assert_eq!(saved.host_key_fingerprint.as_deref(), Some(crate::testing::FAKE_HOST_KEY));
    }

    #[tokio::test]
    async fn test_unreachable_host_falls_back_to_reset() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        h.shell.set_unreachable(true);

        let outcome = h
            .maintenance
            .run(vm.id, &MaintenanceOp::RestartRuntime)
            .await
            .unwrap();
        assert!(matches!(outcome, MaintenanceOutcome::HardReset { .. }));
        assert!(h.compute.calls().contains(&format!("reset_instance {}", vm.name)));
        assert_eq!(h.store.get_vm(vm.id).await.unwrap().state(), VmState::Running);
    }

    #[tokio::test]
    async fn test_failed_command_is_reported() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        h.shell.set_exit_code(5);

        let err = h
            .maintenance
            .run(vm.id, &MaintenanceOp::Reboot)
            .await
            .unwrap_err();
        assert!(matches!(err, MaintenanceError::CommandFailed { exit_code: 5, .. }));
    }

    #[tokio::test]
    async fn test_stopped_vm_is_rejected() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        h.provisioner.stop(vm.id).await.unwrap();

        let err = h
            .maintenance
            .run(vm.id, &MaintenanceOp::DiskUsage)
            .await
            .unwrap_err();
        assert!(matches!(err, MaintenanceError::VmNotRunning { .. }));
    }
}
