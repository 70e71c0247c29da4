//! Sandbox lifecycle on the local container engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::config::{Config, SandboxConfig};
use crate::lifecycle::{Journal, LifecycleState, SandboxState};
use crate::model::{KIND_LABEL, OWNER_LABEL, Resource, Sandbox};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ExecOutput, NetworkAttachment, TraceSink, pack_file,
    unpack_file,
};
use crate::sandbox::error::{Result, SandboxError};

const SANDBOX_KIND: &str = "sandbox";
const FILE_MODE: u32 = 0o644;

/// Parameters for a new sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxRequest {
    /// Falls back to the configured default image.
    pub image: Option<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Creates and manages sandboxes on the local engine.
pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    journal: Journal,
    config: SandboxConfig,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, journal: Journal, config: &Config) -> Self {
        Self {
            runtime,
            journal,
            config: config.sandbox.clone(),
        }
    }

    /// Register a sandbox and bring it up.
    pub async fn create(&self, request: SandboxRequest) -> Result<Sandbox> {
        let image = request
            .image
            .unwrap_or_else(|| self.config.default_image.clone());
        let mut sandbox = Sandbox::new(&self.config.name_prefix, image);
        sandbox.env = request.env;
        sandbox.labels = request.labels;
        self.journal.save(&sandbox).await?;
        self.launch(sandbox.id).await
    }

    /// Create the network and container for a pending (or failed and
    /// cleaned up) sandbox.
    pub async fn launch(&self, id: Uuid) -> Result<Sandbox> {
        let mut sandbox = self.journal.store().get_sandbox(id).await?;
        if !sandbox.state().can_transition_to(SandboxState::Creating) {
            tracing::info!(sandbox = %id, state = %sandbox.state(), "Skipping launch");
            return Ok(sandbox);
        }

        self.journal
            .transition(&mut sandbox, SandboxState::Creating, None)
            .await?;

        match self.run_launch(&mut sandbox).await {
            Ok(()) => Ok(sandbox),
            Err(e) => {
                self.journal.fail(&mut sandbox, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn run_launch(&self, sandbox: &mut Sandbox) -> Result<()> {
        let id = sandbox.id;
        let events = self.journal.events().clone();
        let sink = move |line: &str| events.log(id, line);

        self.journal
            .log(sandbox, format!("Pulling {}", sandbox.image));
        self.runtime.pull_image(&sandbox.image, &sink).await?;

        let labels = self.labels_for(sandbox);
        let network_id = self
            .runtime
            .create_network(&sandbox.network_name(), &labels)
            .await?;
        sandbox.network_id = Some(network_id);
        self.journal.save(sandbox).await?;

        let spec = ContainerSpec {
            name: sandbox.name.clone(),
            image: sandbox.image.clone(),
            env: sandbox
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels,
            network: Some(NetworkAttachment {
                network: sandbox.network_name(),
                aliases: vec![sandbox.name.clone()],
            }),
            ..Default::default()
        };
        let container_id = self.runtime.create_container(&spec).await?;
        sandbox.container_id = Some(container_id.clone());
        self.journal.save(sandbox).await?;

        self.runtime.start_container(&container_id).await?;
        self.journal
            .transition(sandbox, SandboxState::Running, None)
            .await?;
        Ok(())
    }

    fn labels_for(&self, sandbox: &Sandbox) -> HashMap<String, String> {
        let mut labels: HashMap<String, String> = sandbox
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(OWNER_LABEL.to_string(), sandbox.id.to_string());
        labels.insert(KIND_LABEL.to_string(), SANDBOX_KIND.to_string());
        labels
    }

    pub async fn start(&self, id: Uuid) -> Result<Sandbox> {
        let mut sandbox = self.journal.store().get_sandbox(id).await?;
        if sandbox.state() != SandboxState::Stopped {
            tracing::info!(sandbox = %id, state = %sandbox.state(), "Skipping start");
            return Ok(sandbox);
        }
        if let Some(container_id) = sandbox.container_id.clone()
            && let Err(e) = self.runtime.start_container(&container_id).await
        {
            self.journal.fail(&mut sandbox, &e.to_string()).await;
            return Err(e.into());
        }
        self.journal
            .transition(&mut sandbox, SandboxState::Running, None)
            .await?;
        Ok(sandbox)
    }

    pub async fn stop(&self, id: Uuid) -> Result<Sandbox> {
        let mut sandbox = self.journal.store().get_sandbox(id).await?;
        if sandbox.state() != SandboxState::Running {
            tracing::info!(sandbox = %id, state = %sandbox.state(), "Skipping stop");
            return Ok(sandbox);
        }
        if let Some(container_id) = sandbox.container_id.clone()
            && let Err(e) = self.runtime.stop_container(&container_id).await
        {
            self.journal.fail(&mut sandbox, &e.to_string()).await;
            return Err(e.into());
        }
        self.journal
            .transition(&mut sandbox, SandboxState::Stopped, None)
            .await?;
        Ok(sandbox)
    }

    /// Remove the container and network. Always ends in `destroyed`.
    pub async fn destroy(&self, id: Uuid) -> Result<Sandbox> {
        let mut sandbox = self.journal.store().get_sandbox(id).await?;
        match sandbox.state() {
            SandboxState::Destroyed => return Ok(sandbox),
            SandboxState::Destroying => {}
            state if !state.can_transition_to(SandboxState::Destroying) => {
                self.journal
                    .transition(
                        &mut sandbox,
                        SandboxState::Error,
                        Some(format!("destroy requested while {}", state)),
                    )
                    .await?;
                self.journal
                    .transition(&mut sandbox, SandboxState::Destroying, None)
                    .await?;
            }
            _ => {
                self.journal
                    .transition(&mut sandbox, SandboxState::Destroying, None)
                    .await?;
            }
        }

        self.teardown(&mut sandbox).await;
        self.journal
            .transition(&mut sandbox, SandboxState::Destroyed, None)
            .await?;
        Ok(sandbox)
    }

    /// Best-effort removal by recorded id, by name and by owner label. A
    /// recorded id is cleared only once its removal succeeds.
    async fn teardown(&self, sandbox: &mut Sandbox) {
        if let Some(id) = sandbox.container_id.clone() {
            match self.runtime.remove_container(&id).await {
                Ok(()) => sandbox.container_id = None,
                Err(e) => self.warn(sandbox, format!("Failed to remove container {id}: {e}")),
            }
        }
        let mut containers = vec![sandbox.name.clone()];
        match self
            .runtime
            .list_containers(&format!("{}={}", OWNER_LABEL, sandbox.id))
            .await
        {
            Ok(found) => containers.extend(found.into_iter().map(|c| c.id)),
            Err(e) => self.warn(sandbox, format!("Failed to list containers: {e}")),
        }
        for container in containers {
            if let Err(e) = self.runtime.remove_container(&container).await {
                self.warn(sandbox, format!("Failed to remove container {container}: {e}"));
            }
        }

        if let Some(id) = sandbox.network_id.clone() {
            match self.runtime.remove_network(&id).await {
                Ok(()) => sandbox.network_id = None,
                Err(e) => self.warn(sandbox, format!("Failed to remove network {id}: {e}")),
            }
        }
        let mut networks = Vec::new();
        match self.runtime.list_networks(&sandbox.network_name()).await {
            Ok(found) => networks.extend(found.into_iter().map(|n| n.id)),
            Err(e) => self.warn(sandbox, format!("Failed to list networks: {e}")),
        }
        networks.dedup();
        for network in networks {
            if let Err(e) = self.runtime.remove_network(&network).await {
                self.warn(sandbox, format!("Failed to remove network {network}: {e}"));
            }
        }

        if let Err(e) = self.journal.save(sandbox).await {
            tracing::warn!(sandbox = %sandbox.id, "Failed to persist teardown progress: {}", e);
        }
    }

    fn warn(&self, sandbox: &Sandbox, line: String) {
        tracing::warn!(sandbox = %sandbox.id, "{}", line);
        self.journal.log(sandbox, line);
    }

    /// Clean up after an interrupted or failed launch so it can be retried.
    pub async fn cleanup(&self, sandbox: &mut Sandbox) -> Result<()> {
        if sandbox.state().is_in_progress() {
            let message = format!("interrupted while {}", sandbox.state());
            self.journal.fail(sandbox, &message).await;
        }
        self.journal.log(sandbox, "Cleaning up before retry");
        self.teardown(sandbox).await;
        Ok(())
    }

    async fn running_container(&self, id: Uuid) -> Result<String> {
        let sandbox = self.journal.store().get_sandbox(id).await?;
        match (&sandbox.container_id, sandbox.state()) {
            (Some(container_id), SandboxState::Running) => Ok(container_id.clone()),
            (_, state) => Err(SandboxError::NotRunning {
                id,
                state: state.to_string(),
            }),
        }
    }

    /// Run a command inside the sandbox.
    pub async fn exec(&self, id: Uuid, cmd: &[String]) -> Result<ExecOutput> {
        let container_id = self.running_container(id).await?;
        tracing::debug!(sandbox = %id, cmd = ?cmd, "Exec in sandbox");
        Ok(self.runtime.exec_run(&container_id, cmd, &[]).await?)
    }

    /// Write `contents` to the absolute `path` inside the sandbox.
    pub async fn write_file(&self, id: Uuid, path: &str, contents: &[u8]) -> Result<()> {
        let (dir, name) = split_path(path)?;
        let container_id = self.running_container(id).await?;
        let tar = pack_file(name, contents, FILE_MODE)?;
        self.runtime.upload_archive(&container_id, dir, tar).await?;
        Ok(())
    }

    /// Read the file at the absolute `path` inside the sandbox.
    pub async fn read_file(&self, id: Uuid, path: &str) -> Result<Vec<u8>> {
        split_path(path)?;
        let container_id = self.running_container(id).await?;
        let tar = self.runtime.download_archive(&container_id, path).await?;
        Ok(unpack_file(&tar)?)
    }

    /// Remove sandbox containers whose owning record is gone or destroyed.
    /// Returns how many were removed.
    pub async fn prune_orphans(&self) -> Result<usize> {
        let live: HashSet<String> = self
            .journal
            .store()
            .list_sandboxes()
            .await?
            .into_iter()
            .filter(|s| !s.state().is_terminal())
            .map(|s| s.id.to_string())
            .collect();

        let mut removed = 0;
        let containers = self
            .runtime
            .list_containers(&format!("{}={}", KIND_LABEL, SANDBOX_KIND))
            .await?;
        for container in containers {
            let owner = container
                .labels
                .as_ref()
                .and_then(|l| l.get(OWNER_LABEL))
                .cloned()
                .unwrap_or_default();
            if live.contains(&owner) {
                continue;
            }
            tracing::info!(container = %container.id, owner = %owner, "Removing orphaned sandbox container");
            self.runtime.remove_container(&container.id).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Pull an image ahead of time so the first launch is quick.
    pub async fn warm_image(&self, image: Option<&str>) -> Result<()> {
        let image = image.unwrap_or(&self.config.default_image);
        self.runtime.pull_image(image, &TraceSink).await?;
        Ok(())
    }
}

/// Split an absolute file path into its directory and file name.
fn split_path(path: &str) -> Result<(&str, &str)> {
    let invalid = || SandboxError::InvalidPath {
        path: path.to_string(),
    };
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(invalid());
    }
    let (dir, name) = path.rsplit_once('/').ok_or_else(invalid)?;
    if name.is_empty() || name == "." || name == ".." {
        return Err(invalid());
    }
    Ok((if dir.is_empty() { "/" } else { dir }, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InfraStore;
    use crate::testing::TestHarness;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/work/main.rs").unwrap(), ("/work", "main.rs"));
        assert_eq!(split_path("/notes").unwrap(), ("/", "notes"));
        assert!(split_path("relative.txt").is_err());
        assert!(split_path("/work/").is_err());
        assert!(split_path("/work/..").is_err());
    }

    #[tokio::test]
    async fn test_create_runs_container_on_own_network() {
        let h = TestHarness::new();
        let sandbox = h
            .sandboxes
            .create(SandboxRequest {
                env: BTreeMap::from([("LANG".to_string(), "C.UTF-8".to_string())]),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(sandbox.state(), SandboxState::Running);
        assert_eq!(sandbox.image, "ubuntu:24.04");
        let container = h.runtime.container(&sandbox.name).unwrap();
        assert!(container.running);
        assert_eq!(container.spec.env, vec!["LANG=C.UTF-8".to_string()]);
        assert_eq!(
            container.spec.labels.get(OWNER_LABEL),
            Some(&sandbox.id.to_string())
        );
        assert_eq!(
            container.spec.network.unwrap().network,
            sandbox.network_name()
        );
    }

    #[tokio::test]
    async fn test_files_round_trip_through_archives() {
        let h = TestHarness::new();
        let sandbox = h.sandboxes.create(SandboxRequest::default()).await.unwrap();

        h.sandboxes
            .write_file(sandbox.id, "/work/hello.txt", b"hi there")
            .await
            .unwrap();
        let back = h
            .sandboxes
            .read_file(sandbox.id, "/work/hello.txt")
            .await
            .unwrap();
        assert_eq!(back, b"hi there");
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let h = TestHarness::new();
        let sandbox = h.sandboxes.create(SandboxRequest::default()).await.unwrap();
        h.sandboxes.stop(sandbox.id).await.unwrap();

        let err = h
            .sandboxes
            .exec(sandbox.id, &["true".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning { .. }));

        h.sandboxes.start(sandbox.id).await.unwrap();
        let out = h
            .sandboxes
            .exec(sandbox.id, &["true".to_string()])
            .await
            .unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_failed_launch_records_error() {
        let h = TestHarness::new();
        h.runtime.fail_on("pull");
        let err = h
            .sandboxes
            .create(SandboxRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));

        let sandboxes = h.store.list_sandboxes().await.unwrap();
        assert_eq!(sandboxes[0].state(), SandboxState::Error);
    }

    #[tokio::test]
    async fn test_destroy_and_prune_orphans() {
        let h = TestHarness::new();
        let keep = h.sandboxes.create(SandboxRequest::default()).await.unwrap();
        let gone = h.sandboxes.create(SandboxRequest::default()).await.unwrap();

        h.sandboxes.destroy(gone.id).await.unwrap();
        assert!(h.runtime.container(&gone.name).is_none());
        assert_eq!(h.runtime.network_count(), 1);

        // a container whose record never made it to the store
        h.runtime.insert_container(
            "stray",
            HashMap::from([
                (OWNER_LABEL.to_string(), Uuid::new_v4().to_string()),
                (KIND_LABEL.to_string(), SANDBOX_KIND.to_string()),
            ]),
        );
        assert_eq!(h.sandboxes.prune_orphans().await.unwrap(), 1);
        assert!(h.runtime.container(&keep.name).is_some());
        assert!(h.runtime.container("stray").is_none());
    }
}
