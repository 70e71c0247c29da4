//! Persistence seam for resource records.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Deployment, Sandbox, VmInstance};

#[async_trait]
pub trait InfraStore: Send + Sync {
    async fn get_vm(&self, id: Uuid) -> Result<VmInstance, StoreError>;
    async fn save_vm(&self, vm: &VmInstance) -> Result<(), StoreError>;
    async fn list_vms(&self) -> Result<Vec<VmInstance>, StoreError>;

    async fn get_deployment(&self, id: Uuid) -> Result<Deployment, StoreError>;
    async fn save_deployment(&self, deployment: &Deployment) -> Result<(), StoreError>;
    /// Every deployment on a VM, in any state.
    async fn list_deployments_on_vm(&self, vm_id: Uuid) -> Result<Vec<Deployment>, StoreError>;

    async fn get_sandbox(&self, id: Uuid) -> Result<Sandbox, StoreError>;
    async fn save_sandbox(&self, sandbox: &Sandbox) -> Result<(), StoreError>;
    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>, StoreError>;
}

/// In-process store. Records (secrets included) live only in memory.
#[derive(Default)]
pub struct MemoryStore {
    vms: RwLock<HashMap<Uuid, VmInstance>>,
    deployments: RwLock<HashMap<Uuid, Deployment>>,
    sandboxes: RwLock<HashMap<Uuid, Sandbox>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InfraStore for MemoryStore {
    async fn get_vm(&self, id: Uuid) -> Result<VmInstance, StoreError> {
        self.vms
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "vm", id })
    }

    async fn save_vm(&self, vm: &VmInstance) -> Result<(), StoreError> {
        self.vms.write().await.insert(vm.id, vm.clone());
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<VmInstance>, StoreError> {
        Ok(self.vms.read().await.values().cloned().collect())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Deployment, StoreError> {
        self.deployments
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "deployment",
                id,
            })
    }

    async fn save_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        self.deployments
            .write()
            .await
            .insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn list_deployments_on_vm(&self, vm_id: Uuid) -> Result<Vec<Deployment>, StoreError> {
        Ok(self
            .deployments
            .read()
            .await
            .values()
            .filter(|d| d.vm_id == vm_id)
            .cloned()
            .collect())
    }

    async fn get_sandbox(&self, id: Uuid) -> Result<Sandbox, StoreError> {
        self.sandboxes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "sandbox",
                id,
            })
    }

    async fn save_sandbox(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
        self.sandboxes
            .write()
            .await
            .insert(sandbox.id, sandbox.clone());
        Ok(())
    }

    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>, StoreError> {
        Ok(self.sandboxes.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_not_found() {
        let store = MemoryStore::new();
        let vm = VmInstance::new("infra", "z", "p");
        store.save_vm(&vm).await.unwrap();
        assert_eq!(store.get_vm(vm.id).await.unwrap().name, vm.name);

        let missing = Uuid::new_v4();
        assert!(matches!(
            store.get_vm(missing).await,
            Err(StoreError::NotFound { entity: "vm", .. })
        ));
    }

    #[tokio::test]
    async fn test_deployments_filtered_by_vm() {
        let store = MemoryStore::new();
        let vm_a = Uuid::new_v4();
        let vm_b = Uuid::new_v4();
        store.save_deployment(&Deployment::new(vm_a, "a")).await.unwrap();
        store.save_deployment(&Deployment::new(vm_a, "b")).await.unwrap();
        store.save_deployment(&Deployment::new(vm_b, "c")).await.unwrap();
        assert_eq!(store.list_deployments_on_vm(vm_a).await.unwrap().len(), 2);
    }
}
