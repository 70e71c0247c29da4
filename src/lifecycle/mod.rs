//! Lifecycle state machines, the transition journal, and reconciliation.

mod reconcile;
mod state;

use std::sync::Arc;

pub use reconcile::{Plan, ReconcileOutcome, Reconciler};
pub use state::{
    DeploymentState, Lifecycle, LifecycleState, SandboxState, StateTransition, TransitionError,
    VmState,
};

use crate::error::StoreError;
use crate::events::{EventBus, ResourceEvent};
use crate::model::Resource;
use crate::store::InfraStore;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies transitions, persists the record, and publishes the change.
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn InfraStore>,
    events: EventBus,
}

impl Journal {
    pub fn new(store: Arc<dyn InfraStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<dyn InfraStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Publish a log line for `record`.
    pub fn log<R: Resource>(&self, record: &R, line: impl Into<String>) {
        self.events.log(record.id(), line);
    }

    /// Persist `record` without changing its state.
    pub async fn save<R: Resource>(&self, record: &R) -> Result<(), LifecycleError> {
        record.save(self.store.as_ref()).await?;
        Ok(())
    }

    pub async fn transition<R: Resource>(
        &self,
        record: &mut R,
        to: R::State,
        reason: Option<String>,
    ) -> Result<(), LifecycleError> {
        let change = record.lifecycle_mut().transition(to, reason)?;
        record.save(self.store.as_ref()).await?;

        tracing::info!(
            kind = <R::State as LifecycleState>::KIND,
            id = %record.id(),
            "{} -> {}",
            change.from,
            change.to
        );
        self.events.publish(
            record.id(),
            ResourceEvent::StateChanged {
                from: change.from.to_string(),
                to: change.to.to_string(),
            },
        );
        Ok(())
    }

    /// Record a failure: keep the raw message, move to the error state, and
    /// publish a final failure line.
    ///
    /// Problems while recording are logged; the caller is already returning
    /// the original error.
    pub async fn fail<R: Resource>(&self, record: &mut R, message: &str) {
        let id = record.id();
        let error_state = <R::State as LifecycleState>::ERROR;
        let lifecycle = record.lifecycle_mut();
        if lifecycle.state != error_state
            && let Err(e) = lifecycle.transition(error_state, Some(message.to_string()))
        {
            tracing::warn!(id = %id, "Cannot record failure: {}", e);
        }
        lifecycle.error_message = Some(message.to_string());

        if let Err(e) = record.save(self.store.as_ref()).await {
            tracing::warn!(id = %id, "Failed to persist failure state: {}", e);
        }
        tracing::error!(
            kind = <R::State as LifecycleState>::KIND,
            id = %id,
            "Operation failed: {}",
            message
        );
        self.events.publish(
            id,
            ResourceEvent::Failed {
                message: message.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sandbox;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_transition_persists_and_publishes() {
        let store = Arc::new(MemoryStore::new());
        let journal = Journal::new(store.clone(), EventBus::new());
        let mut sandbox = Sandbox::new("sandbox", "ubuntu:24.04");
        let mut rx = journal.events().subscribe(sandbox.id);

        journal
            .transition(&mut sandbox, SandboxState::Creating, None)
            .await
            .unwrap();

        assert_eq!(
            store.get_sandbox(sandbox.id).await.unwrap().state(),
            SandboxState::Creating
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ResourceEvent::StateChanged {
                from: "pending".to_string(),
                to: "creating".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_fail_records_message_and_state() {
        let store = Arc::new(MemoryStore::new());
        let journal = Journal::new(store.clone(), EventBus::new());
        let mut sandbox = Sandbox::new("sandbox", "ubuntu:24.04");
        let mut rx = journal.events().subscribe(sandbox.id);

        journal.fail(&mut sandbox, "image not found").await;
        journal.fail(&mut sandbox, "still not found").await;

        let saved = store.get_sandbox(sandbox.id).await.unwrap();
        assert_eq!(saved.state(), SandboxState::Error);
        assert_eq!(saved.lifecycle.error_message.as_deref(), Some("still not found"));
        assert_eq!(saved.lifecycle.transitions.len(), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            ResourceEvent::Failed {
                message: "image not found".to_string()
            }
        );
    }
}
