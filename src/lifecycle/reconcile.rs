//! Cleanup-and-retry for jobs that are re-delivered after a partial run.
//!
//! Workers hand every (re)delivered job to the [`Reconciler`]. Records in a
//! settled state are left alone. Records that failed, or that were caught
//! mid-operation, first get a best-effort teardown of everything they may
//! have created (by recorded id and by deterministic name) and are then
//! retried from scratch.

use std::sync::Arc;

use uuid::Uuid;

use crate::deploy::DeployOrchestrator;
use crate::error::Error;
use crate::lifecycle::LifecycleState;
use crate::model::Resource;
use crate::sandbox::SandboxManager;
use crate::store::InfraStore;
use crate::vm::VmProvisioner;

/// What to do with a re-delivered job, decided from the record's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Run the operation directly.
    Proceed,
    /// Tear down leftovers, then run the operation.
    CleanupThenRetry,
    /// Already settled; do nothing.
    Skip,
}

/// What a reconcile call ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped { state: String },
    Proceeded { state: String },
    Retried { state: String },
}

pub struct Reconciler {
    store: Arc<dyn InfraStore>,
    provisioner: Arc<VmProvisioner>,
    deployer: Arc<DeployOrchestrator>,
    sandboxes: Arc<SandboxManager>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn InfraStore>,
        provisioner: Arc<VmProvisioner>,
        deployer: Arc<DeployOrchestrator>,
        sandboxes: Arc<SandboxManager>,
    ) -> Self {
        Self {
            store,
            provisioner,
            deployer,
            sandboxes,
        }
    }

    pub fn plan<S: LifecycleState>(state: S) -> Plan {
        if state.is_settled() {
            Plan::Skip
        } else if state == S::ERROR || state.is_in_progress() {
            Plan::CleanupThenRetry
        } else {
            Plan::Proceed
        }
    }

    /// Drive a VM toward `running`.
    pub async fn reconcile_vm(&self, id: Uuid) -> Result<ReconcileOutcome, Error> {
        let mut vm = self.store.get_vm(id).await?;
        let plan = Self::plan(vm.state());
        tracing::info!(vm = %vm.name, state = %vm.state(), ?plan, "Reconciling VM");

        match plan {
            Plan::Skip => Ok(ReconcileOutcome::Skipped {
                state: vm.state().to_string(),
            }),
            Plan::Proceed => {
                let vm = self.provisioner.provision(id).await?;
                Ok(ReconcileOutcome::Proceeded {
                    state: vm.state().to_string(),
                })
            }
            Plan::CleanupThenRetry => {
                self.provisioner.cleanup(&mut vm).await?;
                let vm = self.provisioner.provision(id).await?;
                Ok(ReconcileOutcome::Retried {
                    state: vm.state().to_string(),
                })
            }
        }
    }

    /// Drive a deployment toward `running`.
    pub async fn reconcile_deployment(&self, id: Uuid) -> Result<ReconcileOutcome, Error> {
        let mut deployment = self.store.get_deployment(id).await?;
        let plan = Self::plan(deployment.state());
        tracing::info!(deployment = %id, state = %deployment.state(), ?plan, "Reconciling deployment");

        match plan {
            Plan::Skip => Ok(ReconcileOutcome::Skipped {
                state: deployment.state().to_string(),
            }),
            Plan::Proceed => {
                let deployment = self.deployer.deploy(id).await?;
                Ok(ReconcileOutcome::Proceeded {
                    state: deployment.state().to_string(),
                })
            }
            Plan::CleanupThenRetry => {
                self.deployer.cleanup(&mut deployment).await?;
                let deployment = self.deployer.deploy(id).await?;
                Ok(ReconcileOutcome::Retried {
                    state: deployment.state().to_string(),
                })
            }
        }
    }

    /// Drive a sandbox toward `running`.
    pub async fn reconcile_sandbox(&self, id: Uuid) -> Result<ReconcileOutcome, Error> {
        let mut sandbox = self.store.get_sandbox(id).await?;
        let plan = Self::plan(sandbox.state());
        tracing::info!(sandbox = %id, state = %sandbox.state(), ?plan, "Reconciling sandbox");

        match plan {
            Plan::Skip => Ok(ReconcileOutcome::Skipped {
                state: sandbox.state().to_string(),
            }),
            Plan::Proceed => {
                let sandbox = self.sandboxes.launch(id).await?;
                Ok(ReconcileOutcome::Proceeded {
                    state: sandbox.state().to_string(),
                })
            }
            Plan::CleanupThenRetry => {
                self.sandboxes.cleanup(&mut sandbox).await?;
                let sandbox = self.sandboxes.launch(id).await?;
                Ok(ReconcileOutcome::Retried {
                    state: sandbox.state().to_string(),
                })
            }
        }
    }
}
