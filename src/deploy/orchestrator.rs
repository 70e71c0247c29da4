use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use rand::distributions::Alphanumeric;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::config::{Config, DeployConfig, RuntimeConfig};
use crate::deploy::error::{DeployError, Result};
use crate::lifecycle::{DeploymentState, Journal, LifecycleState, VmState};
use crate::model::{Deployment, KIND_LABEL, OWNER_LABEL, Resource};
use crate::proxy::{ProxyConfigManager, ProxyRoute};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, NetworkAttachment, PortBinding, RestartPolicy,
    RuntimeConnector, RuntimeTarget,
};

/// Repository for images built on the VM's own engine. These are never
/// pulled.
const LOCAL_IMAGE_REPO: &str = "infracore-local/";

const DB_PORT: u16 = 5432;
const DB_PASSWORD_LEN: usize = 32;

/// Deploys applications and their databases onto VMs.
pub struct DeployOrchestrator {
    connector: Arc<dyn RuntimeConnector>,
    proxy: Arc<ProxyConfigManager>,
    journal: Journal,
    deploy: DeployConfig,
    runtime: RuntimeConfig,
}

impl DeployOrchestrator {
    pub fn new(
        connector: Arc<dyn RuntimeConnector>,
        proxy: Arc<ProxyConfigManager>,
        journal: Journal,
        config: &Config,
    ) -> Self {
        Self {
            connector,
            proxy,
            journal,
            deploy: config.deploy.clone(),
            runtime: config.runtime.clone(),
        }
    }

    /// Register a pending deployment on `vm_id`.
    pub async fn create(
        &self,
        vm_id: Uuid,
        project: &str,
        domain: Option<&str>,
        env: BTreeMap<String, String>,
    ) -> Result<Deployment> {
        self.journal.store().get_vm(vm_id).await?;

        let mut deployment = Deployment::new(vm_id, project);
        if let Some(domain) = domain {
            // validated the same way the route will be
            deployment.domain = Some(ProxyRoute::new(domain, "127.0.0.1:1")?.domain);
        }
        deployment.env = env;
        self.journal.save(&deployment).await?;
        Ok(deployment)
    }

    /// Mesh address of a VM that can take deployments.
    async fn vm_host(&self, vm_id: Uuid) -> Result<String> {
        let vm = self.journal.store().get_vm(vm_id).await?;
        if vm.state() != VmState::Running {
            return Err(DeployError::VmNotReady {
                vm_id,
                reason: format!("VM is {}", vm.state()),
            });
        }
        vm.mesh_ip.ok_or_else(|| DeployError::VmNotReady {
            vm_id,
            reason: "VM has no mesh address".to_string(),
        })
    }

    fn runtime_for(&self, host: &str) -> Arc<dyn ContainerRuntime> {
        self.connector
            .connect(&RuntimeTarget::remote(host, &self.runtime))
    }

    /// Build the application image on the VM's engine from a tar context
    /// and record its reference. The lifecycle state is unchanged.
    pub async fn build(&self, id: Uuid, context: Bytes) -> Result<Deployment> {
        let mut deployment = self.journal.store().get_deployment(id).await?;
        let host = self.vm_host(deployment.vm_id).await?;
        let runtime = self.runtime_for(&host);

        let tag = format!(
            "{}{}:{}",
            LOCAL_IMAGE_REPO,
            repository_slug(&deployment.project),
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        self.journal
            .log(&deployment, format!("Building image {}", tag));

        let events = self.journal.events().clone();
        let sink = move |line: &str| events.log(id, line);
        if let Err(e) = runtime.build_image(&tag, context, &sink).await {
            self.journal
                .log(&deployment, format!("Build failed: {}", e));
            return Err(e.into());
        }

        deployment.image_ref = Some(tag);
        self.journal.save(&deployment).await?;
        self.journal.log(&deployment, "Build complete");
        Ok(deployment)
    }

    /// Deploy (or redeploy) the built image.
    pub async fn deploy(&self, id: Uuid) -> Result<Deployment> {
        let mut deployment = self.journal.store().get_deployment(id).await?;
        let image = deployment
            .image_ref
            .clone()
            .ok_or(DeployError::MissingImage { id })?;

        if !deployment
            .state()
            .can_transition_to(DeploymentState::Deploying)
        {
            tracing::info!(deployment = %id, state = %deployment.state(), "Skipping deploy");
            return Ok(deployment);
        }
        let host = self.vm_host(deployment.vm_id).await?;

        self.journal
            .transition(&mut deployment, DeploymentState::Deploying, None)
            .await?;

        match self.run_deploy(&mut deployment, &host, &image).await {
            Ok(()) => Ok(deployment),
            Err(e) => {
                self.journal.fail(&mut deployment, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn run_deploy(&self, deployment: &mut Deployment, host: &str, image: &str) -> Result<()> {
        let runtime = self.runtime_for(host);
        let id = deployment.id;
        let events = self.journal.events().clone();
        let sink = move |line: &str| events.log(id, line);

        if image.starts_with(LOCAL_IMAGE_REPO) {
            self.journal
                .log(deployment, format!("Using locally built image {}", image));
        } else {
            self.journal.log(deployment, format!("Pulling {}", image));
            runtime.pull_image(image, &sink).await?;
        }
        self.journal
            .log(deployment, format!("Pulling {}", self.deploy.db_image));
        runtime.pull_image(&self.deploy.db_image, &sink).await?;

        self.remove_containers(runtime.as_ref(), deployment).await?;

        let labels = owner_labels(deployment);
        let network_id = runtime
            .create_network(&deployment.network_name(), &labels)
            .await?;
        deployment.network_id = Some(network_id);
        self.journal.save(deployment).await?;

        let password = match &deployment.db_password {
            Some(p) => p.clone(),
            None => {
                let p = generate_password();
                deployment.db_password = Some(p.clone());
                p
            }
        };

        let db_spec = ContainerSpec {
            name: deployment.db_container_name(),
            image: self.deploy.db_image.clone(),
            env: vec![
                format!("POSTGRES_DB={}", deployment.db_name),
                format!("POSTGRES_USER={}", deployment.db_user),
                format!("POSTGRES_PASSWORD={}", password.expose_secret()),
            ],
            labels: labels.clone(),
            network: Some(NetworkAttachment {
                network: deployment.network_name(),
                aliases: vec![deployment.db_alias()],
            }),
            restart_policy: RestartPolicy::UnlessStopped,
            ..Default::default()
        };
        self.journal.log(deployment, "Starting database");
        let db_id = runtime.create_container(&db_spec).await?;
        deployment.db_container_id = Some(db_id.clone());
        self.journal.save(deployment).await?;
        runtime.start_container(&db_id).await?;
        self.wait_for_db(runtime.as_ref(), deployment, &db_id).await?;

        let port = self.choose_port(deployment).await?;
        if deployment.external_port != Some(port) {
            deployment.external_port = Some(port);
            self.journal.save(deployment).await?;
        }

        let mut env = vec![format!(
            "DATABASE_URL=postgres://{}:{}@{}:{}/{}",
            deployment.db_user,
            password.expose_secret(),
            deployment.db_alias(),
            DB_PORT,
            deployment.db_name
        )];
        env.extend(deployment.env.iter().map(|(k, v)| format!("{k}={v}")));

        let app_spec = ContainerSpec {
            name: deployment.app_container_name(),
            image: image.to_string(),
            env,
            labels,
            ports: vec![PortBinding {
                container_port: self.deploy.app_port,
                host_port: port,
                host_ip: "0.0.0.0".to_string(),
            }],
            network: Some(NetworkAttachment {
                network: deployment.network_name(),
                aliases: Vec::new(),
            }),
            restart_policy: RestartPolicy::UnlessStopped,
            ..Default::default()
        };
        self.journal
            .log(deployment, format!("Starting application on port {}", port));
        let app_id = runtime.create_container(&app_spec).await?;
        deployment.app_container_id = Some(app_id.clone());
        self.journal.save(deployment).await?;
        runtime.start_container(&app_id).await?;

        if let Some(domain) = &deployment.domain {
            let route = ProxyRoute::new(domain.as_str(), format!("127.0.0.1:{}", port))?;
            self.proxy.add_route(host, &route).await?;
            self.journal
                .log(deployment, format!("Routed {} to port {}", route.domain, port));
        }

        self.journal
            .transition(deployment, DeploymentState::Running, None)
            .await?;
        Ok(())
    }

    async fn wait_for_db(
        &self,
        runtime: &dyn ContainerRuntime,
        deployment: &Deployment,
        db_id: &str,
    ) -> Result<()> {
        let probe = vec![
            "pg_isready".to_string(),
            "-U".to_string(),
            deployment.db_user.clone(),
            "-d".to_string(),
            deployment.db_name.clone(),
        ];
        let attempts = self.deploy.db_ready_attempts;
        for attempt in 1..=attempts {
            match runtime.exec_run(db_id, &probe, &[]).await {
                Ok(output) if output.success() => {
                    tracing::debug!(deployment = %deployment.id, attempt, "Database ready");
                    return Ok(());
                }
                Ok(output) => {
                    tracing::debug!(attempt, exit_code = output.exit_code, "Database not ready yet")
                }
                Err(e) => tracing::debug!(attempt, "Readiness probe failed: {}", e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.deploy.db_ready_delay).await;
            }
        }
        Err(DeployError::DbNotReady {
            name: deployment.db_container_name(),
            attempts,
            delay: self.deploy.db_ready_delay,
        })
    }

    /// Keep the existing port, or take the lowest one no other live
    /// deployment on the VM holds.
    async fn choose_port(&self, deployment: &Deployment) -> Result<u16> {
        if let Some(port) = deployment.external_port {
            return Ok(port);
        }

        let taken: HashSet<u16> = self
            .journal
            .store()
            .list_deployments_on_vm(deployment.vm_id)
            .await?
            .into_iter()
            .filter(|d| d.id != deployment.id && d.holds_port())
            .filter_map(|d| d.external_port)
            .collect();

        (self.deploy.port_range_start..=self.deploy.port_range_end)
            .find(|p| !taken.contains(p))
            .ok_or(DeployError::NoFreePort {
                vm_id: deployment.vm_id,
                start: self.deploy.port_range_start,
                end: self.deploy.port_range_end,
            })
    }

    /// Remove containers and network left by an earlier attempt, by id and
    /// by name, stopping at the first failure.
    async fn remove_containers(
        &self,
        runtime: &dyn ContainerRuntime,
        deployment: &mut Deployment,
    ) -> Result<()> {
        let containers = [
            deployment.app_container_id.take(),
            Some(deployment.app_container_name()),
            deployment.db_container_id.take(),
            Some(deployment.db_container_name()),
        ];
        for container in containers.into_iter().flatten() {
            runtime.remove_container(&container).await?;
        }

        if let Some(network_id) = deployment.network_id.take() {
            runtime.remove_network(&network_id).await?;
        }
        for network in runtime.list_networks(&deployment.network_name()).await? {
            runtime.remove_network(&network.id).await?;
        }

        self.journal.save(deployment).await?;
        Ok(())
    }

    /// Stop both containers without removing them.
    pub async fn stop(&self, id: Uuid) -> Result<Deployment> {
        let mut deployment = self.journal.store().get_deployment(id).await?;
        if deployment.state() != DeploymentState::Running {
            tracing::info!(deployment = %id, state = %deployment.state(), "Skipping stop");
            return Ok(deployment);
        }
        let host = self.vm_host(deployment.vm_id).await?;

        self.journal
            .transition(&mut deployment, DeploymentState::Stopping, None)
            .await?;
        let runtime = self.runtime_for(&host);
        let result = async {
            for container in [&deployment.app_container_id, &deployment.db_container_id]
                .into_iter()
                .flatten()
            {
                runtime.stop_container(container).await?;
            }
            Ok::<_, DeployError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.journal
                    .transition(&mut deployment, DeploymentState::Stopped, None)
                    .await?;
                Ok(deployment)
            }
            Err(e) => {
                self.journal.fail(&mut deployment, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Start a stopped deployment's containers, database first.
    pub async fn start(&self, id: Uuid) -> Result<Deployment> {
        let mut deployment = self.journal.store().get_deployment(id).await?;
        if deployment.state() != DeploymentState::Stopped {
            tracing::info!(deployment = %id, state = %deployment.state(), "Skipping start");
            return Ok(deployment);
        }
        let host = self.vm_host(deployment.vm_id).await?;
        let runtime = self.runtime_for(&host);

        let result = async {
            for container in [&deployment.db_container_id, &deployment.app_container_id]
                .into_iter()
                .flatten()
            {
                runtime.start_container(container).await?;
            }
            Ok::<_, DeployError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.journal
                    .transition(&mut deployment, DeploymentState::Running, None)
                    .await?;
                Ok(deployment)
            }
            Err(e) => {
                self.journal.fail(&mut deployment, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Remove containers, network and proxy route, then mark destroyed.
    ///
    /// Removal failures are logged; the record always ends in `destroyed`.
    pub async fn destroy(&self, id: Uuid) -> Result<Deployment> {
        let mut deployment = self.journal.store().get_deployment(id).await?;
        match deployment.state() {
            DeploymentState::Destroyed => {
                tracing::info!(deployment = %id, "Already destroyed");
                return Ok(deployment);
            }
            DeploymentState::Destroying => {}
            state if !state.can_transition_to(DeploymentState::Destroying) => {
                self.journal
                    .transition(
                        &mut deployment,
                        DeploymentState::Error,
                        Some(format!("destroy requested while {}", state)),
                    )
                    .await?;
                self.journal
                    .transition(&mut deployment, DeploymentState::Destroying, None)
                    .await?;
            }
            _ => {
                self.journal
                    .transition(&mut deployment, DeploymentState::Destroying, None)
                    .await?;
            }
        }

        self.teardown(&mut deployment, true).await;
        self.journal
            .transition(&mut deployment, DeploymentState::Destroyed, None)
            .await?;
        Ok(deployment)
    }

    /// Best-effort removal of everything the deployment may have created.
    async fn teardown(&self, deployment: &mut Deployment, remove_route: bool) {
        let host = match self.journal.store().get_vm(deployment.vm_id).await {
            Ok(vm) => vm.mesh_ip,
            Err(e) => {
                self.warn(deployment, format!("Cannot look up VM: {e}"));
                None
            }
        };
        let Some(host) = host else {
            self.warn(deployment, "VM has no mesh address; skipping container cleanup".to_string());
            return;
        };

        let runtime = self.runtime_for(&host);
        self.remove_leftovers(runtime.as_ref(), deployment).await;

        if remove_route
            && let Some(domain) = deployment.domain.clone()
            && let Err(e) = self.proxy.remove_route(&host, &domain).await
        {
            self.warn(deployment, format!("Failed to remove route for {domain}: {e}"));
        }
    }

    /// Try every container and network independently. A recorded id is
    /// cleared only once its removal succeeds.
    async fn remove_leftovers(&self, runtime: &dyn ContainerRuntime, deployment: &mut Deployment) {
        if let Some(id) = deployment.app_container_id.clone()
            && self.try_remove_container(runtime, deployment, &id).await
        {
            deployment.app_container_id = None;
        }
        let name = deployment.app_container_name();
        self.try_remove_container(runtime, deployment, &name).await;

        if let Some(id) = deployment.db_container_id.clone()
            && self.try_remove_container(runtime, deployment, &id).await
        {
            deployment.db_container_id = None;
        }
        let name = deployment.db_container_name();
        self.try_remove_container(runtime, deployment, &name).await;

        if let Some(id) = deployment.network_id.clone()
            && self.try_remove_network(runtime, deployment, &id).await
        {
            deployment.network_id = None;
        }
        match runtime.list_networks(&deployment.network_name()).await {
            Ok(found) => {
                for network in found {
                    self.try_remove_network(runtime, deployment, &network.id).await;
                }
            }
            Err(e) => self.warn(deployment, format!("Failed to list networks: {e}")),
        }

        if let Err(e) = self.journal.save(deployment).await {
            tracing::warn!(deployment = %deployment.id, "Failed to persist teardown progress: {}", e);
        }
    }

    async fn try_remove_container(
        &self,
        runtime: &dyn ContainerRuntime,
        deployment: &Deployment,
        container: &str,
    ) -> bool {
        match runtime.remove_container(container).await {
            Ok(()) => true,
            Err(e) => {
                self.warn(deployment, format!("Failed to remove container {container}: {e}"));
                false
            }
        }
    }

    async fn try_remove_network(
        &self,
        runtime: &dyn ContainerRuntime,
        deployment: &Deployment,
        network: &str,
    ) -> bool {
        match runtime.remove_network(network).await {
            Ok(()) => true,
            Err(e) => {
                self.warn(deployment, format!("Failed to remove network {network}: {e}"));
                false
            }
        }
    }

    fn warn(&self, deployment: &Deployment, line: String) {
        tracing::warn!(deployment = %deployment.id, "{}", line);
        self.journal.log(deployment, line);
    }

    /// Clean up after an interrupted or failed deploy so it can be retried.
    /// The external port and proxy route are kept.
    pub async fn cleanup(&self, deployment: &mut Deployment) -> Result<()> {
        if deployment.state().is_in_progress() {
            let message = format!("interrupted while {}", deployment.state());
            self.journal.fail(deployment, &message).await;
        }
        self.journal.log(deployment, "Cleaning up before retry");
        self.teardown(deployment, false).await;
        self.journal.save(deployment).await?;
        Ok(())
    }
}

fn owner_labels(deployment: &Deployment) -> HashMap<String, String> {
    HashMap::from([
        (OWNER_LABEL.to_string(), deployment.id.to_string()),
        (KIND_LABEL.to_string(), "deployment".to_string()),
    ])
}

fn generate_password() -> SecretString {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(DB_PASSWORD_LEN)
        .map(char::from)
        .collect();
    SecretString::from(password)
}

/// Image repository names must be lowercase `[a-z0-9._-]`.
fn repository_slug(project: &str) -> String {
    let slug: String = project
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if slug.is_empty() {
        "app".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InfraStore;
    use crate::testing::TestHarness;

    #[test]
    fn test_repository_slug() {
        assert_eq!(repository_slug("My Shop!"), "my-shop");
        assert_eq!(repository_slug("api_v2"), "api_v2");
        assert_eq!(repository_slug("$$$"), "app");
    }

    #[test]
    fn test_generated_password_shape() {
        let p = generate_password();
        assert_eq!(p.expose_secret().len(), DB_PASSWORD_LEN);
        assert!(p.expose_secret().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_deploy_without_image_is_a_hard_error() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        let d = h
            .deployer
            .create(vm.id, "shop", None, BTreeMap::new())
            .await
            .unwrap();

        let err = h.deployer.deploy(d.id).await.unwrap_err();
        assert!(matches!(err, DeployError::MissingImage { .. }));
        let saved = h.store.get_deployment(d.id).await.unwrap();
        assert_eq!(saved.state(), DeploymentState::Pending);
    }

    #[tokio::test]
    async fn test_deploy_wires_database_and_route() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        let mut d = h
            .deployer
            .create(
                vm.id,
                "shop",
                Some("Shop.Example.com"),
                BTreeMap::from([("MODE".to_string(), "prod".to_string())]),
            )
            .await
            .unwrap();
        d.image_ref = Some("registry.example.com/shop:1".to_string());
        h.store.save_deployment(&d).await.unwrap();

        let d = h.deployer.deploy(d.id).await.unwrap();
        assert_eq!(d.state(), DeploymentState::Running);
        assert_eq!(d.external_port, Some(10000));

        let app = h.runtime.container(&d.app_container_name()).unwrap();
        assert!(app.running);
        assert!(app.spec.env.iter().any(|e| e.starts_with("DATABASE_URL=postgres://")
            && e.contains(&format!("@{}:5432/", d.db_alias()))));
        assert!(app.spec.env.contains(&"MODE=prod".to_string()));
        assert_eq!(app.spec.ports[0].host_port, 10000);

        let db = h.runtime.container(&d.db_container_name()).unwrap();
        assert_eq!(
            db.spec.network.as_ref().unwrap().aliases,
            vec![d.db_alias()]
        );

        let routes = h.proxy.list_routes(vm.mesh_ip.as_deref().unwrap()).await.unwrap();
        assert_eq!(
            routes,
            vec![ProxyRoute::new("shop.example.com", "127.0.0.1:10000").unwrap()]
        );
    }

    #[tokio::test]
    async fn test_locally_built_images_are_not_pulled() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        let d = h
            .deployer
            .create(vm.id, "Shop", None, BTreeMap::new())
            .await
            .unwrap();

        let d = h
            .deployer
            .build(d.id, Bytes::from_static(b"context"))
            .await
            .unwrap();
        let image = d.image_ref.clone().unwrap();
        assert!(image.starts_with("infracore-local/shop:"));

        h.deployer.deploy(d.id).await.unwrap();
        let calls = h.runtime.calls();
        assert!(!calls.contains(&format!("pull {image}")));
        assert!(calls.contains(&"pull postgres:16-alpine".to_string()));
    }

    #[tokio::test]
    async fn test_db_never_ready_fails_deployment() {
        let h = TestHarness::new();
        h.runtime.set_exec_exit_code(2);
        let vm = h.running_vm().await;
        let d = h.deployment_with_image(vm.id).await;

        let err = h.deployer.deploy(d.id).await.unwrap_err();
        assert!(matches!(err, DeployError::DbNotReady { .. }));
        let saved = h.store.get_deployment(d.id).await.unwrap();
        assert_eq!(saved.state(), DeploymentState::Error);
        assert!(saved.lifecycle.error_message.unwrap().contains("not ready"));
        // the database container stays for the next attempt to replace
        assert!(h.runtime.container(&d.db_container_name()).is_some());
    }

    #[tokio::test]
    async fn test_stop_then_start() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        let d = h.deployment_with_image(vm.id).await;
        h.deployer.deploy(d.id).await.unwrap();

        let stopped = h.deployer.stop(d.id).await.unwrap();
        assert_eq!(stopped.state(), DeploymentState::Stopped);
        assert!(!h.runtime.container(&d.app_container_name()).unwrap().running);
        assert!(h.runtime.container(&d.app_container_name()).is_some());

        let started = h.deployer.start(d.id).await.unwrap();
        assert_eq!(started.state(), DeploymentState::Running);
        assert!(h.runtime.container(&d.db_container_name()).unwrap().running);
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        let mut d = h.deployment_with_image(vm.id).await;
        d.domain = Some("a.example.com".to_string());
        h.store.save_deployment(&d).await.unwrap();
        h.deployer.deploy(d.id).await.unwrap();

        let d = h.deployer.destroy(d.id).await.unwrap();
        assert_eq!(d.state(), DeploymentState::Destroyed);
        assert_eq!(h.runtime.container_count(), 0);
        assert_eq!(h.runtime.network_count(), 0);
        let host = vm.mesh_ip.unwrap();
        assert!(h.proxy.list_routes(&host).await.unwrap().is_empty());

        // second destroy is a no-op
        assert_eq!(
            h.deployer.destroy(d.id).await.unwrap().state(),
            DeploymentState::Destroyed
        );
    }

    #[tokio::test]
    async fn test_destroy_keeps_going_after_a_removal_failure() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        let d = h.deployment_with_image(vm.id).await;
        let deployed = h.deployer.deploy(d.id).await.unwrap();
        let db_id = deployed.db_container_id.clone().unwrap();

        h.runtime.fail_on("remove");
        let destroyed = h.deployer.destroy(d.id).await.unwrap();
        assert_eq!(destroyed.state(), DeploymentState::Destroyed);

        let calls = h.runtime.calls();
        assert!(calls.contains(&format!("remove {db_id}")));
        assert!(calls.contains(&format!("remove {}", d.db_container_name())));
        assert!(calls.iter().any(|c| c.starts_with("remove_network ")));
        assert_eq!(h.runtime.network_count(), 0);

        // ids that could not be removed stay on the record
        let saved = h.store.get_deployment(d.id).await.unwrap();
        assert_eq!(saved.db_container_id.as_deref(), Some(db_id.as_str()));
        assert!(saved.app_container_id.is_some());
        assert!(saved.network_id.is_none());
    }

    #[tokio::test]
    async fn test_deploy_requires_running_vm() {
        let h = TestHarness::new();
        let vm = h.provisioner.create(None).await.unwrap();
        let d = h.deployment_with_image(vm.id).await;
        let err = h.deployer.deploy(d.id).await.unwrap_err();
        assert!(matches!(err, DeployError::VmNotReady { .. }));
    }
}
