//! Container runtime client.
//!
//! A thin, typed client for the container engine's HTTP control API. The same
//! client talks to the local engine over its control socket (sandboxes, local
//! builds) and to remote engines over their mesh-only TCP port (deployments).
//!
//! ```text
//!   SandboxManager ──┐                      ┌──► unix:///var/run/docker.sock
//!                    ├──► ContainerRuntime ─┤
//!   DeployOrchestrator┘    (DockerClient)   └──► tcp://<mesh-ip>:2375
//! ```
//!
//! Cleanup paths call `stop_container`, `remove_container` and
//! `remove_network` unconditionally, so all three treat "not found" as
//! success.

mod archive;
mod client;
pub mod error;
pub mod frames;
pub mod progress;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use archive::{pack_file, unpack_file};
pub use client::DockerClient;
pub use error::{Result, RuntimeError};
pub use progress::{LogSink, TraceSink};
pub use types::{
    ContainerInfo, ContainerInfoConfig, ContainerSpec, ContainerState, ContainerSummary, DiskUsage,
    ExecOutput, NetworkAttachment, NetworkSummary, PortBinding, PruneReport, RegistryAuth,
    RestartPolicy, RuntimeTarget, split_image_ref,
};

use crate::config::RuntimeConfig;

/// Operations against one container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the engine answers.
    async fn ping(&self) -> Result<()>;

    /// Pull an image, forwarding progress lines to `sink`.
    async fn pull_image(&self, image: &str, sink: &dyn LogSink) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a container. Already-running is success.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container. Already-stopped or missing is success.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container and its anonymous volumes. Missing is success.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Inspect a container; `None` when it does not exist.
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>>;

    /// List containers (running or not) carrying `label` (`key` or `key=value`).
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>>;

    /// Run a command in a running container and collect its output.
    async fn exec_run(&self, id: &str, cmd: &[String], env: &[String]) -> Result<ExecOutput>;

    /// Extract a tar archive into `path` inside the container.
    async fn upload_archive(&self, id: &str, path: &str, tar: Bytes) -> Result<()>;

    /// Fetch `path` from the container as a tar archive.
    async fn download_archive(&self, id: &str, path: &str) -> Result<Bytes>;

    /// Create a bridge network and return its id.
    async fn create_network(&self, name: &str, labels: &HashMap<String, String>)
    -> Result<String>;

    /// Attach a container to a network under the given aliases.
    async fn connect_network(&self, network: &str, container: &str, aliases: &[String])
    -> Result<()>;

    /// Remove a network. Missing is success.
    async fn remove_network(&self, id: &str) -> Result<()>;

    /// List networks whose name matches `name` exactly.
    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkSummary>>;

    /// Remove unused images (`all_unused`) or only dangling ones.
    async fn prune_images(&self, all_unused: bool) -> Result<PruneReport>;

    /// Remove stopped containers.
    async fn prune_containers(&self) -> Result<PruneReport>;

    /// Engine disk usage summary.
    async fn disk_usage(&self) -> Result<DiskUsage>;

    /// Build an image from a tar build context.
    async fn build_image(&self, tag: &str, context: Bytes, sink: &dyn LogSink) -> Result<()>;

    /// Push an image to its registry.
    async fn push_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        sink: &dyn LogSink,
    ) -> Result<()>;
}

/// Hands out a runtime client for a target.
///
/// Orchestrators hold one of these instead of a client so the same code can
/// address the local engine and any number of remote ones.
pub trait RuntimeConnector: Send + Sync {
    fn connect(&self, target: &RuntimeTarget) -> Arc<dyn ContainerRuntime>;
}

/// Connector producing [`DockerClient`]s.
#[derive(Debug, Clone, Default)]
pub struct DockerConnector {
    config: RuntimeConfig,
}

impl DockerConnector {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl RuntimeConnector for DockerConnector {
    fn connect(&self, target: &RuntimeTarget) -> Arc<dyn ContainerRuntime> {
        Arc::new(DockerClient::new(target.clone(), &self.config))
    }
}
