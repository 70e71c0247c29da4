use std::collections::HashMap;
use std::sync::Arc;

use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::cloud::{ComputeApi, InstanceRequest, StartupScript, wait_for_operation};
use crate::config::{CloudConfig, Config, MeshConfig, SshConfig};
use crate::keys::KeyPair;
use crate::lifecycle::{Journal, LifecycleState, VmState};
use crate::mesh::{JoinKeyRequest, MeshApi, matching_devices, wait_for_device};
use crate::model::{Resource, VmInstance};
use crate::ssh::{CommandOutput, HostKeyPolicy, ShellTarget};
use crate::vm::error::{ProvisionError, Result};

const NETWORK_TAGS: &[&str] = &["http-server", "https-server"];

/// Drives VM instances through their lifecycle.
pub struct VmProvisioner {
    compute: Arc<dyn ComputeApi>,
    mesh: Arc<dyn MeshApi>,
    journal: Journal,
    cloud: CloudConfig,
    mesh_config: MeshConfig,
    ssh: SshConfig,
    runtime_port: u16,
    proxy_admin_port: u16,
}

impl VmProvisioner {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        mesh: Arc<dyn MeshApi>,
        journal: Journal,
        config: &Config,
    ) -> Self {
        Self {
            compute,
            mesh,
            journal,
            cloud: config.cloud.clone(),
            mesh_config: config.mesh.clone(),
            ssh: config.ssh.clone(),
            runtime_port: config.runtime.remote_port,
            proxy_admin_port: config.proxy.admin_port,
        }
    }

    pub fn compute(&self) -> &Arc<dyn ComputeApi> {
        &self.compute
    }

    /// Register a pending instance record.
    pub async fn create(&self, extra_startup_script: Option<String>) -> Result<VmInstance> {
        let project = self.cloud.require_project()?;
        let mut vm = VmInstance::new(&self.cloud.name_prefix, &self.cloud.zone, project);
        vm.extra_startup_script = extra_startup_script;
        self.journal.save(&vm).await?;
        Ok(vm)
    }

    /// Create the cloud instance and wait until it has joined the mesh.
    pub async fn provision(&self, id: Uuid) -> Result<VmInstance> {
        let mut vm = self.journal.store().get_vm(id).await?;
        if !vm.state().can_transition_to(VmState::Provisioning) {
            tracing::info!(vm = %vm.name, state = %vm.state(), "Skipping provision");
            return Ok(vm);
        }

        self.journal
            .transition(&mut vm, VmState::Provisioning, None)
            .await?;

        match self.run_provision(&mut vm).await {
            Ok(()) => Ok(vm),
            Err(e) => {
                self.journal.fail(&mut vm, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn run_provision(&self, vm: &mut VmInstance) -> Result<()> {
        self.journal.log(vm, "Minting mesh join key");
        let join_key = self
            .mesh
            .create_join_key(&JoinKeyRequest {
                tags: vec![self.mesh_config.tag.clone()],
                expiry: self.mesh_config.key_expiry,
                description: format!("infracore {}", vm.name),
            })
            .await?;

        let nat_ip = if self.cloud.reserve_static_ip {
            Some(self.reserve_address(vm).await?)
        } else {
            None
        };

        let public_key = self.ensure_key_pair(vm).await?;

        let startup_script = StartupScript {
            hostname: vm.name.clone(),
            mesh_auth_key: join_key.key,
            mesh_tag: self.mesh_config.tag.clone(),
            runtime_port: self.runtime_port,
            proxy_admin_port: self.proxy_admin_port,
            extra: vm.extra_startup_script.clone(),
        }
        .render();

        let request = InstanceRequest {
            name: vm.name.clone(),
            machine_type: self.cloud.machine_type.clone(),
            source_image: self.cloud.source_image.clone(),
            disk_size_gb: self.cloud.disk_size_gb,
            nat_ip: nat_ip.clone(),
            startup_script,
            ssh_keys: Some(format!("{}:{}", self.ssh.user, public_key)),
            network_tags: NETWORK_TAGS.iter().map(|t| t.to_string()).collect(),
            labels: HashMap::from([("infracore-vm".to_string(), vm.id.simple().to_string())]),
        };

        self.journal.log(vm, format!("Creating instance {}", vm.name));
        let op = self.compute.insert_instance(&request).await?;
        wait_for_operation(
            self.compute.as_ref(),
            op,
            self.cloud.op_poll_interval,
            self.cloud.op_max_polls,
        )
        .await?;

        let external_ip = match nat_ip {
            Some(ip) => Some(ip),
            None => self
                .compute
                .get_instance(&vm.name)
                .await?
                .and_then(|info| info.external_ip),
        };

        self.journal
            .log(vm, "Instance created, waiting for it to join the mesh");
        let device = wait_for_device(
            self.mesh.as_ref(),
            &vm.name,
            self.mesh_config.join_attempts,
            self.mesh_config.join_delay,
        )
        .await?;

        vm.external_ip = external_ip;
        vm.mesh_ip = device.ipv4().map(String::from);
        vm.mesh_hostname = Some(device.hostname.clone());
        vm.mesh_device_id = Some(device.id.clone());
        let reason = format!("mesh address {}", device.ipv4().unwrap_or_default());
        self.journal
            .transition(vm, VmState::Running, Some(reason))
            .await?;
        self.journal.log(vm, format!("VM {} is running", vm.name));
        Ok(())
    }

    /// Reserve (or reuse) the instance's static address and return its IP.
    async fn reserve_address(&self, vm: &mut VmInstance) -> Result<String> {
        let name = vm.address_name();

        if let Some(ip) = self.compute.get_address(&name).await? {
            tracing::info!(address = %name, "Reusing reserved address");
            vm.reserved_address_name = Some(name);
            self.journal.save(vm).await?;
            return Ok(ip);
        }

        self.journal.log(vm, format!("Reserving static address {}", name));
        let op = self.compute.reserve_address(&name).await?;
        // Recorded before polling so teardown releases it even if the poll fails.
        vm.reserved_address_name = Some(name.clone());
        self.journal.save(vm).await?;
        wait_for_operation(
            self.compute.as_ref(),
            op,
            self.cloud.op_poll_interval,
            self.cloud.op_max_polls,
        )
        .await?;

        self.compute
            .get_address(&name)
            .await?
            .ok_or(ProvisionError::AddressUnavailable { name })
    }

    /// Generate the instance key pair on first use; return the public line.
    async fn ensure_key_pair(&self, vm: &mut VmInstance) -> Result<String> {
        if let Some(private) = &vm.ssh_private_key {
            let pair = KeyPair::decode(private.expose_secret())?;
            let public = pair.public_key_text();
            if vm.ssh_public_key.as_deref() != Some(public.as_str()) {
                vm.ssh_public_key = Some(public.clone());
                self.journal.save(vm).await?;
            }
            return Ok(public);
        }

        let pair = KeyPair::generate(format!("{}@{}", self.ssh.user, vm.name));
        let public = pair.public_key_text();
        vm.ssh_private_key = Some(pair.private_key_text());
        vm.ssh_public_key = Some(public.clone());
        self.journal.save(vm).await?;
        Ok(public)
    }

    pub async fn start(&self, id: Uuid) -> Result<VmInstance> {
        let mut vm = self.journal.store().get_vm(id).await?;
        if vm.state() != VmState::Stopped {
            tracing::info!(vm = %vm.name, state = %vm.state(), "Skipping start");
            return Ok(vm);
        }

        let op = self.compute.start_instance(&vm.name).await?;
        wait_for_operation(
            self.compute.as_ref(),
            op,
            self.cloud.op_poll_interval,
            self.cloud.op_max_polls,
        )
        .await?;
        self.journal.transition(&mut vm, VmState::Running, None).await?;
        Ok(vm)
    }

    pub async fn stop(&self, id: Uuid) -> Result<VmInstance> {
        let mut vm = self.journal.store().get_vm(id).await?;
        if vm.state() != VmState::Running {
            tracing::info!(vm = %vm.name, state = %vm.state(), "Skipping stop");
            return Ok(vm);
        }

        let op = self.compute.stop_instance(&vm.name).await?;
        wait_for_operation(
            self.compute.as_ref(),
            op,
            self.cloud.op_poll_interval,
            self.cloud.op_max_polls,
        )
        .await?;
        self.journal.transition(&mut vm, VmState::Stopped, None).await?;
        Ok(vm)
    }

    /// Hard-reset the instance. The lifecycle state is unchanged.
    pub async fn reset(&self, vm: &VmInstance) -> Result<()> {
        self.journal.log(vm, format!("Hard-resetting instance {}", vm.name));
        let op = self.compute.reset_instance(&vm.name).await?;
        wait_for_operation(
            self.compute.as_ref(),
            op,
            self.cloud.op_poll_interval,
            self.cloud.op_max_polls,
        )
        .await?;
        Ok(())
    }

    /// Tear down the instance, its address and its mesh device.
    ///
    /// Cloud-side failures are logged, not returned: the record always ends
    /// in `destroyed`.
    pub async fn destroy(&self, id: Uuid) -> Result<VmInstance> {
        let mut vm = self.journal.store().get_vm(id).await?;
        match vm.state() {
            VmState::Destroyed | VmState::Destroying => {
                tracing::info!(vm = %vm.name, state = %vm.state(), "Skipping destroy");
                if vm.state() == VmState::Destroyed {
                    return Ok(vm);
                }
            }
            VmState::Pending | VmState::Provisioning => {
                // Only settled instances may enter destroying.
                self.journal
                    .transition(
                        &mut vm,
                        VmState::Error,
                        Some("destroy requested before provisioning finished".to_string()),
                    )
                    .await?;
                self.journal
                    .transition(&mut vm, VmState::Destroying, None)
                    .await?;
            }
            _ => {
                self.journal
                    .transition(&mut vm, VmState::Destroying, None)
                    .await?;
            }
        }

        self.teardown(&mut vm, false).await;
        self.journal
            .transition(&mut vm, VmState::Destroyed, None)
            .await?;
        Ok(vm)
    }

    /// Best-effort removal of everything this instance may own.
    ///
    /// With `by_name`, also tries the deterministic names in case ids were
    /// never persisted.
    async fn teardown(&self, vm: &mut VmInstance, by_name: bool) {
        match self.compute.delete_instance(&vm.name).await {
            Ok(Some(op)) => {
                if let Err(e) = wait_for_operation(
                    self.compute.as_ref(),
                    op,
                    self.cloud.op_poll_interval,
                    self.cloud.op_max_polls,
                )
                .await
                {
                    self.warn(vm, format!("Instance delete did not complete: {e}"));
                }
            }
            Ok(None) => tracing::debug!(vm = %vm.name, "Instance already gone"),
            Err(e) => self.warn(vm, format!("Failed to delete instance: {e}")),
        }

        let mut addresses: Vec<String> = vm.reserved_address_name.iter().cloned().collect();
        if by_name && !addresses.contains(&vm.address_name()) {
            addresses.push(vm.address_name());
        }
        let mut released = true;
        for name in addresses {
            match self.compute.release_address(&name).await {
                Ok(Some(op)) => {
                    if let Err(e) = wait_for_operation(
                        self.compute.as_ref(),
                        op,
                        self.cloud.op_poll_interval,
                        self.cloud.op_max_polls,
                    )
                    .await
                    {
                        released = false;
                        self.warn(vm, format!("Address release did not complete: {e}"));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    released = false;
                    self.warn(vm, format!("Failed to release address {name}: {e}"));
                }
            }
        }
        if released {
            vm.reserved_address_name = None;
        }

        self.remove_mesh_device(vm, by_name).await;
        if let Err(e) = self.journal.save(vm).await {
            tracing::warn!(vm = %vm.name, "Failed to persist teardown progress: {}", e);
        }
    }

    /// Delete the recorded device and, when matching by name, every device
    /// left under the VM's hostname by earlier attempts.
    async fn remove_mesh_device(&self, vm: &mut VmInstance, by_name: bool) {
        let mut device_ids: Vec<String> = vm.mesh_device_id.iter().cloned().collect();
        if by_name || device_ids.is_empty() {
            match self.mesh.list_devices().await {
                Ok(devices) => {
                    for device in matching_devices(&devices, &vm.name) {
                        if !device_ids.contains(&device.id) {
                            device_ids.push(device.id.clone());
                        }
                    }
                }
                Err(e) => self.warn(vm, format!("Failed to list mesh devices: {e}")),
            }
        }

        for device_id in device_ids {
            match self.mesh.delete_device(&device_id).await {
                Ok(()) => {
                    if vm.mesh_device_id.as_deref() == Some(device_id.as_str()) {
                        vm.mesh_device_id = None;
                    }
                }
                Err(e) => self.warn(vm, format!("Failed to remove mesh device {device_id}: {e}")),
            }
        }
    }

    fn warn(&self, vm: &VmInstance, line: String) {
        tracing::warn!(vm = %vm.name, "{}", line);
        self.journal.log(vm, line);
    }

    /// Clean up after an interrupted or failed provision so it can be
    /// retried. Leaves the record in `error`.
    pub async fn cleanup(&self, vm: &mut VmInstance) -> Result<()> {
        if vm.state().is_in_progress() {
            let message = format!("interrupted while {}", vm.state());
            self.journal.fail(vm, &message).await;
        }
        self.journal.log(vm, "Cleaning up before retry");
        self.teardown(vm, true).await;
        vm.external_ip = None;
        vm.mesh_ip = None;
        vm.mesh_hostname = None;
        self.journal.save(vm).await?;
        Ok(())
    }

    /// Shell target and key for a running VM.
    ///
    /// The host key is pinned once known; with strict checking off the
    /// target accepts any key.
    pub fn shell_access(&self, vm: &VmInstance) -> Result<(ShellTarget, KeyPair)> {
        let host = vm.mesh_ip.clone().ok_or_else(|| ProvisionError::NotOnMesh {
            name: vm.name.clone(),
        })?;
        let private = vm
            .ssh_private_key
            .as_ref()
            .ok_or_else(|| ProvisionError::MissingKey {
                name: vm.name.clone(),
            })?;
        let key = KeyPair::decode(private.expose_secret())?;

        let policy = match (&vm.host_key_fingerprint, self.ssh.strict_host_keys) {
            (Some(fp), true) => HostKeyPolicy::Pinned(fp.clone()),
            _ => HostKeyPolicy::AcceptAny,
        };
        let target = ShellTarget::new(host, self.ssh.port, &self.ssh.user).with_host_key(policy);
        Ok((target, key))
    }

    /// Pin the host key seen on the first successful connection.
    pub async fn record_host_key(&self, vm: &mut VmInstance, output: &CommandOutput) -> Result<()> {
        if vm.host_key_fingerprint.is_none()
            && let Some(fp) = &output.host_key_fingerprint
        {
            tracing::info!(vm = %vm.name, fingerprint = %fp, "Pinned host key");
            vm.host_key_fingerprint = Some(fp.clone());
            self.journal.save(vm).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InfraStore;
    use crate::testing::{FAKE_HOST_KEY, TestHarness, test_config};

    #[tokio::test]
    async fn test_provision_reaches_running_with_mesh_address() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;

        assert_eq!(vm.state(), VmState::Running);
        assert!(vm.mesh_ip.as_deref().is_some_and(|ip| ip.starts_with("100.64.")));
        assert_eq!(vm.reserved_address_name, Some(vm.address_name()));
        assert!(vm.ssh_private_key.is_some());

        let request = h.compute.last_request().unwrap();
        assert_eq!(request.nat_ip, vm.external_ip);
        assert!(
            request
                .ssh_keys
                .as_deref()
                .is_some_and(|k| k.starts_with("infra:ssh-ed25519 "))
        );
        assert_eq!(h.mesh.key_requests().len(), 1);
        assert_eq!(h.store.get_vm(vm.id).await.unwrap().state(), VmState::Running);
    }

    #[tokio::test]
    async fn test_without_static_ip_uses_ephemeral_address() {
        let mut config = test_config();
        config.cloud.reserve_static_ip = false;
        let h = TestHarness::with_config(config);
        let vm = h.running_vm().await;

        assert!(h.compute.addresses().is_empty());
        assert!(vm.reserved_address_name.is_none());
        assert!(vm.external_ip.is_some());
    }

    #[tokio::test]
    async fn test_failed_operation_leaves_error_and_destroy_releases_address() {
        let h = TestHarness::new();
        h.compute
            .fail_operation("insert_instance", "ZONE_RESOURCE_POOL_EXHAUSTED");
        let vm = h.provisioner.create(None).await.unwrap();

        let err = h.provisioner.provision(vm.id).await.unwrap_err();
        assert!(err.to_string().contains("ZONE_RESOURCE_POOL_EXHAUSTED"));
        let failed = h.store.get_vm(vm.id).await.unwrap();
        assert_eq!(failed.state(), VmState::Error);
        assert!(
            failed
                .lifecycle
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("ZONE_RESOURCE_POOL_EXHAUSTED"))
        );

        let destroyed = h.provisioner.destroy(vm.id).await.unwrap();
        assert_eq!(destroyed.state(), VmState::Destroyed);
        assert!(h.compute.calls().contains(&format!("release_address {}", vm.address_name())));
        assert!(h.compute.addresses().is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_start() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;

        let stopped = h.provisioner.stop(vm.id).await.unwrap();
        assert_eq!(stopped.state(), VmState::Stopped);
        // stopping again is a no-op
        let calls = h.compute.calls().len();
        h.provisioner.stop(vm.id).await.unwrap();
        assert_eq!(h.compute.calls().len(), calls);

        let started = h.provisioner.start(vm.id).await.unwrap();
        assert_eq!(started.state(), VmState::Running);
        assert!(h.compute.calls().contains(&format!("start_instance {}", vm.name)));
    }

    #[tokio::test]
    async fn test_destroy_removes_instance_and_mesh_device() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        let device = vm.mesh_device_id.clone().unwrap();

        let destroyed = h.provisioner.destroy(vm.id).await.unwrap();
        assert_eq!(destroyed.state(), VmState::Destroyed);
        assert!(h.compute.instances().is_empty());
        assert_eq!(h.mesh.deleted(), vec![device]);

        // a second destroy does nothing
        let calls = h.compute.calls().len();
        h.provisioner.destroy(vm.id).await.unwrap();
        assert_eq!(h.compute.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_cleanup_removes_every_device_under_the_hostname() {
        let h = TestHarness::new();
        h.compute.fail_operation("insert_instance", "boom");
        let vm = h.provisioner.create(None).await.unwrap();
        assert!(h.provisioner.provision(vm.id).await.is_err());
        // two earlier attempts joined before their instances went away
        h.mesh.add_device(&vm.name, "100.64.0.90");
        h.mesh.add_device(&format!("{}-1", vm.name), "100.64.0.91");
        let other = h.mesh.add_device("infra-other", "100.64.0.92");

        let mut vm = h.store.get_vm(vm.id).await.unwrap();
        h.provisioner.cleanup(&mut vm).await.unwrap();
        assert_eq!(h.mesh.deleted().len(), 2);
        let left: Vec<String> = h.mesh.devices().into_iter().map(|d| d.id).collect();
        assert_eq!(left, vec![other]);
    }

    #[tokio::test]
    async fn test_destroy_survives_cloud_failures() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        h.compute.fail_call("delete_instance");
        h.mesh.set_failing(true);

        let destroyed = h.provisioner.destroy(vm.id).await.unwrap();
        assert_eq!(destroyed.state(), VmState::Destroyed);
    }

    #[tokio::test]
    async fn test_destroy_pending_goes_through_error() {
        let h = TestHarness::new();
        let vm = h.provisioner.create(None).await.unwrap();

        let destroyed = h.provisioner.destroy(vm.id).await.unwrap();
        assert_eq!(destroyed.state(), VmState::Destroyed);
        let path: Vec<VmState> = destroyed.lifecycle.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![VmState::Error, VmState::Destroying, VmState::Destroyed]
        );
    }

    #[tokio::test]
    async fn test_shell_access_pins_host_key_once_known() {
        let mut config = test_config();
        config.ssh.strict_host_keys = true;
        let h = TestHarness::with_config(config);
        let mut vm = h.running_vm().await;

        let (target, _) = h.provisioner.shell_access(&vm).unwrap();
        assert_eq!(target.host_key, HostKeyPolicy::AcceptAny);
        assert_eq!(Some(target.host.as_str()), vm.mesh_ip.as_deref());

        let output = CommandOutput {
            host_key_fingerprint: Some(FAKE_HOST_KEY.to_string()),
            ..Default::default()
        };
        h.provisioner.record_host_key(&mut vm, &output).await.unwrap();
        let (target, _) = h.provisioner.shell_access(&vm).unwrap();
        assert_eq!(target.host_key, HostKeyPolicy::Pinned(FAKE_HOST_KEY.to_string()));
    }

    #[tokio::test]
    async fn test_shell_access_requires_mesh_address() {
        let h = TestHarness::new();
        let vm = h.provisioner.create(None).await.unwrap();
        let err = h.provisioner.shell_access(&vm).unwrap_err();
        assert!(matches!(err, ProvisionError::NotOnMesh { .. }));
    }
}
