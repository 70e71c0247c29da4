//! In-process doubles for every external collaborator, plus a harness that
//! wires them into the real provisioner, orchestrator and managers.
//!
//! Provides:
//! - [`FakeRuntime`] / [`FakeConnector`]: a container engine kept in memory
//! - [`FakeCompute`]: cloud instances, addresses and long-running operations
//! - [`FakeMesh`]: mesh devices and join keys
//! - [`FakeProxyAdmin`]: per-host proxy documents
//! - [`FakeShell`]: a remote shell that records commands
//! - [`TestHarness`]: everything above, assembled
//!
//! Every fake records its calls and can be told to fail.
//!
//! # Usage
//!
//! ```rust,no_run
//! use infracore::testing::TestHarness;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let h = TestHarness::new();
//!     let vm = h.running_vm().await;
//!     // use h.deployer, h.runtime, h.compute, ...
//! }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;
use serde_json::Value;
use uuid::Uuid;

use crate::cloud::{self, ComputeApi, InstanceInfo, InstanceRequest, Operation, OperationScope};
use crate::cloud::{CloudError, OperationStatus};
use crate::config::Config;
use crate::deploy::DeployOrchestrator;
use crate::events::EventBus;
use crate::keys::KeyPair;
use crate::lifecycle::{Journal, Reconciler};
use crate::maintenance::MaintenanceRunner;
use crate::mesh::{self, JoinKey, JoinKeyRequest, MeshApi, MeshDevice, MeshError};
use crate::model::{Deployment, VmInstance};
use crate::proxy::{self, ProxyAdmin, ProxyConfigManager, ProxyError};
use crate::runtime::{
    self, ContainerInfo, ContainerInfoConfig, ContainerRuntime, ContainerSpec, ContainerState,
    ContainerSummary, DiskUsage, ExecOutput, LogSink, NetworkSummary, PruneReport, RegistryAuth,
    RuntimeConnector, RuntimeError, RuntimeTarget, pack_file,
};
use crate::sandbox::SandboxManager;
use crate::ssh::{self, CommandOutput, HostKeyPolicy, RemoteShell, ShellError, ShellTarget};
use crate::store::{InfraStore, MemoryStore};
use crate::vm::VmProvisioner;

/// Host key fingerprint every [`FakeShell`] session presents.
pub const FAKE_HOST_KEY: &str = "SHA256:ZmFrZS1ob3N0LWtleS1mb3ItdGVzdHM";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Configuration with a project set and every delay zeroed.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.cloud.project = Some("test-project".to_string());
    config.cloud.op_poll_interval = Duration::ZERO;
    config.cloud.op_max_polls = 5;
    config.mesh.join_attempts = 3;
    config.mesh.join_delay = Duration::ZERO;
    config.deploy.db_ready_attempts = 3;
    config.deploy.db_ready_delay = Duration::ZERO;
    config
}

// ── container engine ──────────────────────────────────────────────────────

/// A container held by [`FakeRuntime`].
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    /// Absolute path to contents.
    pub files: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct RuntimeState {
    containers: Vec<FakeContainer>,
    networks: Vec<NetworkSummary>,
    calls: Vec<String>,
    failing: HashSet<String>,
    exec_exit_code: i64,
    build_error: Option<String>,
    next_id: u32,
}

impl RuntimeState {
    fn position(&self, key: &str) -> Option<usize> {
        let key = key.trim_start_matches('/');
        self.containers
            .iter()
            .position(|c| c.id == key || c.spec.name == key)
    }

    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:012x}", prefix, self.next_id)
    }
}

/// A container engine kept in memory.
///
/// Failure injection is by operation name: `pull`, `create`, `start`,
/// `stop`, `remove`, `exec`, `upload`, `download`, `network`, `prune`,
/// `build`, `push`, `ping`.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, as `"<op> <subject>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Make `op` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, op: &str) {
        lock(&self.state).failing.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failing.clear();
    }

    /// Exit code every exec returns.
    pub fn set_exec_exit_code(&self, code: i64) {
        lock(&self.state).exec_exit_code = code;
    }

    /// Make builds end with an error progress record.
    pub fn set_build_error(&self, message: impl Into<String>) {
        lock(&self.state).build_error = Some(message.into());
    }

    /// Look up a container by id or name.
    pub fn container(&self, key: &str) -> Option<FakeContainer> {
        let state = lock(&self.state);
        state.position(key).map(|i| state.containers[i].clone())
    }

    pub fn container_count(&self) -> usize {
        lock(&self.state).containers.len()
    }

    pub fn network_count(&self) -> usize {
        lock(&self.state).networks.len()
    }

    /// Add a running container that no orchestrator created.
    pub fn insert_container(&self, name: &str, labels: HashMap<String, String>) -> String {
        let mut state = lock(&self.state);
        let id = state.next("c");
        state.containers.push(FakeContainer {
            id: id.clone(),
            spec: ContainerSpec {
                name: name.to_string(),
                image: "busybox".to_string(),
                labels,
                ..Default::default()
            },
            running: true,
            files: HashMap::new(),
        });
        id
    }

    /// Record the call and fail if `op` is switched to failing.
    fn enter(&self, op: &str, call: String) -> runtime::Result<MutexGuard<'_, RuntimeState>> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if state.failing.contains(op) {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("injected {op} failure"),
            });
        }
        Ok(state)
    }
}

fn no_such_container(key: &str) -> RuntimeError {
    RuntimeError::NotFound {
        message: format!("No such container: {key}"),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> runtime::Result<()> {
        self.enter("ping", "ping".to_string())?;
        Ok(())
    }

    async fn pull_image(&self, image: &str, sink: &dyn LogSink) -> runtime::Result<()> {
        drop(self.enter("pull", format!("pull {image}"))?);
        sink.line(&format!("{image}: Pull complete"));
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> runtime::Result<String> {
        let mut state = self.enter("create", format!("create {}", spec.name))?;
        if state.position(&spec.name).is_some() {
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            });
        }
        if let Some(attachment) = &spec.network
            && !state.networks.iter().any(|n| n.name == attachment.network)
        {
            return Err(RuntimeError::NotFound {
                message: format!("network {} not found", attachment.network),
            });
        }
        let id = state.next("c");
        state.containers.push(FakeContainer {
            id: id.clone(),
            spec: spec.clone(),
            running: false,
            files: HashMap::new(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> runtime::Result<()> {
        let mut state = self.enter("start", format!("start {id}"))?;
        let i = state.position(id).ok_or_else(|| no_such_container(id))?;
        state.containers[i].running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> runtime::Result<()> {
        let mut state = self.enter("stop", format!("stop {id}"))?;
        if let Some(i) = state.position(id) {
            state.containers[i].running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> runtime::Result<()> {
        let mut state = self.enter("remove", format!("remove {id}"))?;
        if let Some(i) = state.position(id) {
            state.containers.remove(i);
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> runtime::Result<Option<ContainerInfo>> {
        let state = self.enter("inspect", format!("inspect {id}"))?;
        Ok(state.position(id).map(|i| {
            let c = &state.containers[i];
            ContainerInfo {
                id: c.id.clone(),
                name: format!("/{}", c.spec.name),
                state: ContainerState {
                    running: c.running,
                    status: if c.running { "running" } else { "exited" }.to_string(),
                    exit_code: 0,
                },
                config: ContainerInfoConfig {
                    image: c.spec.image.clone(),
                    labels: Some(c.spec.labels.clone()),
                },
            }
        }))
    }

    async fn list_containers(&self, label: &str) -> runtime::Result<Vec<ContainerSummary>> {
        let state = self.enter("list", format!("list_containers {label}"))?;
        let (key, value) = match label.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (label, None),
        };
        Ok(state
            .containers
            .iter()
            .filter(|c| match (c.spec.labels.get(key), value) {
                (Some(v), Some(want)) => v == want,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.spec.name)],
                state: if c.running { "running" } else { "exited" }.to_string(),
                labels: Some(c.spec.labels.clone()),
            })
            .collect())
    }

    async fn exec_run(&self, id: &str, cmd: &[String], _env: &[String]) -> runtime::Result<ExecOutput> {
        let state = self.enter("exec", format!("exec {id} {}", cmd.join(" ")))?;
        let i = state.position(id).ok_or_else(|| no_such_container(id))?;
        if !state.containers[i].running {
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("Container {id} is not running"),
            });
        }
        Ok(ExecOutput {
            exit_code: state.exec_exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn upload_archive(&self, id: &str, path: &str, tar: Bytes) -> runtime::Result<()> {
        let mut state = self.enter("upload", format!("upload {id} {path}"))?;
        let i = state.position(id).ok_or_else(|| no_such_container(id))?;

        let mut archive = tar::Archive::new(&tar[..]);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            let full = format!("{}/{}", path.trim_end_matches('/'), name);
            state.containers[i].files.insert(full, contents);
        }
        Ok(())
    }

    async fn download_archive(&self, id: &str, path: &str) -> runtime::Result<Bytes> {
        let state = self.enter("download", format!("download {id} {path}"))?;
        let i = state.position(id).ok_or_else(|| no_such_container(id))?;
        let contents = state.containers[i]
            .files
            .get(path)
            .ok_or_else(|| RuntimeError::NotFound {
                message: format!("Could not find the file {path} in container {id}"),
            })?;
        let name = path.rsplit('/').next().unwrap_or(path);
        pack_file(name, contents, 0o644)
    }

    async fn create_network(
        &self,
        name: &str,
        _labels: &HashMap<String, String>,
    ) -> runtime::Result<String> {
        let mut state = self.enter("network", format!("create_network {name}"))?;
        let id = state.next("n");
        state.networks.push(NetworkSummary {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        _aliases: &[String],
    ) -> runtime::Result<()> {
        self.enter("network", format!("connect_network {network} {container}"))?;
        Ok(())
    }

    async fn remove_network(&self, id: &str) -> runtime::Result<()> {
        let mut state = self.enter("network", format!("remove_network {id}"))?;
        state.networks.retain(|n| n.id != id && n.name != id);
        Ok(())
    }

    async fn list_networks(&self, name: &str) -> runtime::Result<Vec<NetworkSummary>> {
        let state = self.enter("network", format!("list_networks {name}"))?;
        Ok(state
            .networks
            .iter()
            .filter(|n| n.name == name)
            .cloned()
            .collect())
    }

    async fn prune_images(&self, all_unused: bool) -> runtime::Result<PruneReport> {
        self.enter("prune", format!("prune_images all={all_unused}"))?;
        Ok(PruneReport {
            deleted: 2,
            space_reclaimed: 4096,
        })
    }

    async fn prune_containers(&self) -> runtime::Result<PruneReport> {
        let mut state = self.enter("prune", "prune_containers".to_string())?;
        let before = state.containers.len();
        state.containers.retain(|c| c.running);
        Ok(PruneReport {
            deleted: before - state.containers.len(),
            space_reclaimed: 0,
        })
    }

    async fn disk_usage(&self) -> runtime::Result<DiskUsage> {
        let state = self.enter("df", "disk_usage".to_string())?;
        Ok(DiskUsage {
            containers: state.containers.len(),
            ..Default::default()
        })
    }

    async fn build_image(&self, tag: &str, _context: Bytes, sink: &dyn LogSink) -> runtime::Result<()> {
        let build_error = self.enter("build", format!("build {tag}"))?.build_error.clone();
        sink.line("Step 1/2 : FROM scratch");
        match build_error {
            Some(message) => Err(RuntimeError::Progress { message }),
            None => {
                sink.line(&format!("Successfully tagged {tag}"));
                Ok(())
            }
        }
    }

    async fn push_image(
        &self,
        image: &str,
        _auth: Option<&RegistryAuth>,
        _sink: &dyn LogSink,
    ) -> runtime::Result<()> {
        self.enter("push", format!("push {image}"))?;
        Ok(())
    }
}

/// Connector handing out one shared [`FakeRuntime`] for every target.
pub struct FakeConnector {
    runtime: Arc<FakeRuntime>,
    targets: Mutex<Vec<RuntimeTarget>>,
}

impl FakeConnector {
    pub fn new(runtime: Arc<FakeRuntime>) -> Self {
        Self {
            runtime,
            targets: Mutex::new(Vec::new()),
        }
    }

    /// Targets connected to, in order.
    pub fn targets(&self) -> Vec<RuntimeTarget> {
        lock(&self.targets).clone()
    }
}

impl RuntimeConnector for FakeConnector {
    fn connect(&self, target: &RuntimeTarget) -> Arc<dyn ContainerRuntime> {
        lock(&self.targets).push(target.clone());
        self.runtime.clone()
    }
}

// ── cloud compute ─────────────────────────────────────────────────────────

#[derive(Default)]
struct ComputeState {
    instances: BTreeMap<String, InstanceInfo>,
    addresses: BTreeMap<String, String>,
    requests: Vec<InstanceRequest>,
    /// Operation name to the error it finishes with.
    operations: HashMap<String, Option<String>>,
    calls: Vec<String>,
    failing_calls: HashSet<String>,
    failing_ops: HashMap<String, String>,
    next: u32,
}

/// Cloud compute API kept in memory.
///
/// Mutating calls return a running operation that is done on the first
/// poll. When joined to a [`FakeMesh`], every created instance appears on
/// the mesh under its own name.
#[derive(Default)]
pub struct FakeCompute {
    state: Mutex<ComputeState>,
    mesh: Option<Arc<FakeMesh>>,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn joining(mut self, mesh: Arc<FakeMesh>) -> Self {
        self.mesh = Some(mesh);
        self
    }

    /// Every mutating call, as `"<method> <name>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn instances(&self) -> Vec<String> {
        lock(&self.state).instances.keys().cloned().collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        lock(&self.state).addresses.keys().cloned().collect()
    }

    pub fn last_request(&self) -> Option<InstanceRequest> {
        lock(&self.state).requests.last().cloned()
    }

    /// Make calls to `method` fail with a 500.
    pub fn fail_call(&self, method: &str) {
        lock(&self.state).failing_calls.insert(method.to_string());
    }

    /// Make operations started by `method` finish with `message`.
    pub fn fail_operation(&self, method: &str, message: &str) {
        lock(&self.state)
            .failing_ops
            .insert(method.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.failing_calls.clear();
        state.failing_ops.clear();
    }

    /// An instance left behind by an earlier, interrupted attempt.
    pub fn insert_leftover_instance(&self, name: &str) {
        lock(&self.state).instances.insert(
            name.to_string(),
            InstanceInfo {
                name: name.to_string(),
                status: "RUNNING".to_string(),
                external_ip: Some("34.1.255.1".to_string()),
            },
        );
    }

    fn enter(&self, method: &str, name: &str) -> cloud::Result<MutexGuard<'_, ComputeState>> {
        let mut state = lock(&self.state);
        state.calls.push(format!("{method} {name}"));
        if state.failing_calls.contains(method) {
            return Err(CloudError::Api {
                status: 500,
                message: format!("injected {method} failure"),
            });
        }
        Ok(state)
    }
}

fn start_operation(state: &mut ComputeState, method: &str, scope: OperationScope) -> Operation {
    state.next += 1;
    let name = format!("operation-{}-{}", state.next, method);
    let error = state.failing_ops.get(method).cloned();
    state.operations.insert(name.clone(), error);
    Operation {
        name,
        scope,
        status: OperationStatus::Running,
        error: None,
    }
}

fn zone() -> OperationScope {
    OperationScope::Zone("us-central1-a".to_string())
}

fn instance_not_found(name: &str) -> CloudError {
    CloudError::Api {
        status: 404,
        message: format!("The resource 'instances/{name}' was not found"),
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn insert_instance(&self, request: &InstanceRequest) -> cloud::Result<Operation> {
        let (op, joined) = {
            let mut state = self.enter("insert_instance", &request.name)?;
            state.requests.push(request.clone());
            let op = start_operation(&mut state, "insert_instance", zone());
            let n = state.next;
            let joined = if state.failing_ops.contains_key("insert_instance") {
                None
            } else {
                state.instances.insert(
                    request.name.clone(),
                    InstanceInfo {
                        name: request.name.clone(),
                        status: "RUNNING".to_string(),
                        external_ip: Some(
                            request
                                .nat_ip
                                .clone()
                                .unwrap_or_else(|| format!("34.1.0.{n}")),
                        ),
                    },
                );
                Some(format!("100.64.0.{n}"))
            };
            (op, joined)
        };
        if let (Some(mesh), Some(ip)) = (&self.mesh, joined) {
            mesh.add_device(&request.name, &ip);
        }
        Ok(op)
    }

    async fn get_instance(&self, name: &str) -> cloud::Result<Option<InstanceInfo>> {
        Ok(lock(&self.state).instances.get(name).cloned())
    }

    async fn start_instance(&self, name: &str) -> cloud::Result<Operation> {
        let mut state = self.enter("start_instance", name)?;
        let instance = state
            .instances
            .get_mut(name)
            .ok_or_else(|| instance_not_found(name))?;
        instance.status = "RUNNING".to_string();
        Ok(start_operation(&mut state, "start_instance", zone()))
    }

    async fn stop_instance(&self, name: &str) -> cloud::Result<Operation> {
        let mut state = self.enter("stop_instance", name)?;
        let instance = state
            .instances
            .get_mut(name)
            .ok_or_else(|| instance_not_found(name))?;
        instance.status = "TERMINATED".to_string();
        Ok(start_operation(&mut state, "stop_instance", zone()))
    }

    async fn reset_instance(&self, name: &str) -> cloud::Result<Operation> {
        let mut state = self.enter("reset_instance", name)?;
        if !state.instances.contains_key(name) {
            return Err(instance_not_found(name));
        }
        Ok(start_operation(&mut state, "reset_instance", zone()))
    }

    async fn delete_instance(&self, name: &str) -> cloud::Result<Option<Operation>> {
        let mut state = self.enter("delete_instance", name)?;
        if state.instances.remove(name).is_none() {
            return Ok(None);
        }
        Ok(Some(start_operation(&mut state, "delete_instance", zone())))
    }

    async fn reserve_address(&self, name: &str) -> cloud::Result<Operation> {
        let mut state = self.enter("reserve_address", name)?;
        let op = start_operation(
            &mut state,
            "reserve_address",
            OperationScope::Region("us-central1".to_string()),
        );
        if !state.failing_ops.contains_key("reserve_address") {
            let ip = format!("35.2.0.{}", state.next);
            state.addresses.insert(name.to_string(), ip);
        }
        Ok(op)
    }

    async fn get_address(&self, name: &str) -> cloud::Result<Option<String>> {
        Ok(lock(&self.state).addresses.get(name).cloned())
    }

    async fn release_address(&self, name: &str) -> cloud::Result<Option<Operation>> {
        let mut state = self.enter("release_address", name)?;
        if state.addresses.remove(name).is_none() {
            return Ok(None);
        }
        Ok(Some(start_operation(
            &mut state,
            "release_address",
            OperationScope::Region("us-central1".to_string()),
        )))
    }

    async fn get_operation(&self, operation: &Operation) -> cloud::Result<Operation> {
        let state = lock(&self.state);
        let error = state
            .operations
            .get(&operation.name)
            .ok_or_else(|| CloudError::Api {
                status: 404,
                message: format!("operation {} not found", operation.name),
            })?;
        Ok(Operation {
            name: operation.name.clone(),
            scope: operation.scope.clone(),
            status: OperationStatus::Done,
            error: error.clone(),
        })
    }
}

// ── mesh ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MeshState {
    devices: Vec<MeshDevice>,
    deleted: Vec<String>,
    keys: Vec<JoinKeyRequest>,
    next: u32,
}

/// Mesh control plane kept in memory.
#[derive(Default)]
pub struct FakeMesh {
    state: Mutex<MeshState>,
    failing: AtomicBool,
}

impl FakeMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return its id.
    pub fn add_device(&self, hostname: &str, ipv4: &str) -> String {
        let mut state = lock(&self.state);
        state.next += 1;
        let n = state.next;
        let id = format!("device-{n}");
        state.devices.push(MeshDevice {
            node_id: format!("n{n}CNTRL"),
            id: id.clone(),
            hostname: hostname.to_string(),
            name: format!("{hostname}.tail0000.ts.net"),
            addresses: vec![ipv4.to_string(), format!("fd7a:115c:a1e0::{n}")],
        });
        id
    }

    pub fn devices(&self) -> Vec<MeshDevice> {
        lock(&self.state).devices.clone()
    }

    /// Ids passed to `delete_device`.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    pub fn key_requests(&self) -> Vec<JoinKeyRequest> {
        lock(&self.state).keys.clone()
    }

    pub fn set_failing(&self, fail: bool) {
        self.failing.store(fail, Ordering::Relaxed);
    }

    fn check(&self) -> mesh::Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(MeshError::Api {
                status: 503,
                message: "injected mesh failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MeshApi for FakeMesh {
    async fn create_join_key(&self, request: &JoinKeyRequest) -> mesh::Result<JoinKey> {
        self.check()?;
        let mut state = lock(&self.state);
        state.keys.push(request.clone());
        Ok(JoinKey {
            id: format!("k{}", state.keys.len()),
            key: SecretString::from(format!("tskey-auth-fake{}", state.keys.len())),
            expires: None,
        })
    }

    async fn list_devices(&self) -> mesh::Result<Vec<MeshDevice>> {
        self.check()?;
        Ok(self.devices())
    }

    async fn delete_device(&self, id: &str) -> mesh::Result<()> {
        self.check()?;
        let mut state = lock(&self.state);
        state.deleted.push(id.to_string());
        state.devices.retain(|d| d.id != id);
        Ok(())
    }
}

// ── reverse proxy ─────────────────────────────────────────────────────────

/// Proxy admin API holding one document per host.
///
/// Both calls yield to the scheduler first so concurrent edits interleave.
#[derive(Default)]
pub struct FakeProxyAdmin {
    documents: Mutex<HashMap<String, Value>>,
    loads: AtomicU32,
    failing: AtomicBool,
}

impl FakeProxyAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of whole-document loads so far.
    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn document(&self, host: &str) -> Value {
        lock(&self.documents)
            .get(host)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn set_failing(&self, fail: bool) {
        self.failing.store(fail, Ordering::Relaxed);
    }

    fn check(&self, host: &str) -> proxy::Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ProxyError::Request {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyAdmin for FakeProxyAdmin {
    async fn get_config(&self, host: &str) -> proxy::Result<Value> {
        tokio::task::yield_now().await;
        self.check(host)?;
        Ok(self.document(host))
    }

    async fn load_config(&self, host: &str, document: &Value) -> proxy::Result<()> {
        tokio::task::yield_now().await;
        self.check(host)?;
        lock(&self.documents).insert(host.to_string(), document.clone());
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ── remote shell ──────────────────────────────────────────────────────────

/// Remote shell that records commands and presents [`FAKE_HOST_KEY`].
#[derive(Default)]
pub struct FakeShell {
    commands: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    exit_code: AtomicI32,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// Exit code every command returns.
    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Relaxed);
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn run_command(
        &self,
        target: &ShellTarget,
        _key: &KeyPair,
        command: &str,
        _timeout: Duration,
    ) -> ssh::Result<CommandOutput> {
        if self.unreachable.load(Ordering::Relaxed) {
            return Err(ShellError::Unreachable {
                host: target.host.clone(),
                reason: "Connection refused (os error 111)".to_string(),
            });
        }
        if let HostKeyPolicy::Pinned(expected) = &target.host_key
            && expected != FAKE_HOST_KEY
        {
            return Err(ShellError::HostKeyMismatch {
                host: target.host.clone(),
                expected: expected.clone(),
                actual: FAKE_HOST_KEY.to_string(),
            });
        }

        lock(&self.commands).push(command.to_string());
        let exit_code = self.exit_code.load(Ordering::Relaxed);
        Ok(CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("{command}: failed")
            },
            host_key_fingerprint: Some(FAKE_HOST_KEY.to_string()),
        })
    }
}

// ── harness ───────────────────────────────────────────────────────────────

/// The real lifecycle components wired to the fakes above.
pub struct TestHarness {
    pub config: Config,
    pub store: Arc<MemoryStore>,
    pub journal: Journal,
    pub runtime: Arc<FakeRuntime>,
    pub connector: Arc<FakeConnector>,
    pub compute: Arc<FakeCompute>,
    pub mesh: Arc<FakeMesh>,
    pub proxy_admin: Arc<FakeProxyAdmin>,
    pub proxy: Arc<ProxyConfigManager>,
    pub shell: Arc<FakeShell>,
    pub provisioner: Arc<VmProvisioner>,
    pub deployer: Arc<DeployOrchestrator>,
    pub sandboxes: Arc<SandboxManager>,
    pub reconciler: Reconciler,
    pub maintenance: MaintenanceRunner,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let journal = Journal::new(store.clone(), EventBus::new());

        let runtime = Arc::new(FakeRuntime::new());
        let connector = Arc::new(FakeConnector::new(runtime.clone()));
        let mesh = Arc::new(FakeMesh::new());
        let compute = Arc::new(FakeCompute::new().joining(mesh.clone()));
        let proxy_admin = Arc::new(FakeProxyAdmin::new());
        let proxy = Arc::new(ProxyConfigManager::new(
            proxy_admin.clone(),
            config.proxy.dns_automation(),
        ));
        let shell = Arc::new(FakeShell::new());

        let provisioner = Arc::new(VmProvisioner::new(
            compute.clone(),
            mesh.clone(),
            journal.clone(),
            &config,
        ));
        let deployer = Arc::new(DeployOrchestrator::new(
            connector.clone(),
            proxy.clone(),
            journal.clone(),
            &config,
        ));
        let sandboxes = Arc::new(SandboxManager::new(runtime.clone(), journal.clone(), &config));
        let reconciler = Reconciler::new(
            store.clone(),
            provisioner.clone(),
            deployer.clone(),
            sandboxes.clone(),
        );
        let maintenance = MaintenanceRunner::new(
            connector.clone(),
            shell.clone(),
            provisioner.clone(),
            journal.clone(),
            &config,
        );

        Self {
            config,
            store,
            journal,
            runtime,
            connector,
            compute,
            mesh,
            proxy_admin,
            proxy,
            shell,
            provisioner,
            deployer,
            sandboxes,
            reconciler,
            maintenance,
        }
    }

    /// A freshly provisioned VM in `running`.
    pub async fn running_vm(&self) -> VmInstance {
        let vm = self
            .provisioner
            .create(None)
            .await
            .expect("failed to create VM record");
        self.provisioner
            .provision(vm.id)
            .await
            .expect("failed to provision VM")
    }

    /// A pending deployment on `vm_id` with a registry image set.
    pub async fn deployment_with_image(&self, vm_id: Uuid) -> Deployment {
        let mut deployment = self
            .deployer
            .create(vm_id, "app", None, BTreeMap::new())
            .await
            .expect("failed to create deployment");
        deployment.image_ref = Some("registry.example.com/app:1".to_string());
        self.store
            .save_deployment(&deployment)
            .await
            .expect("failed to save deployment");
        deployment
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::VmState;
    use crate::model::Resource;

    #[tokio::test]
    async fn test_harness_provisions_a_vm() {
        let h = TestHarness::new();
        let vm = h.running_vm().await;
        assert_eq!(vm.state(), VmState::Running);
        assert_eq!(h.mesh.devices().len(), 1);
        assert_eq!(h.compute.instances(), vec![vm.name]);
    }

    #[tokio::test]
    async fn test_fake_runtime_rejects_duplicate_names() {
        let runtime = FakeRuntime::new();
        let spec = ContainerSpec {
            name: "web".to_string(),
            image: "nginx".to_string(),
            ..Default::default()
        };
        runtime.create_container(&spec).await.unwrap();
        let err = runtime.create_container(&spec).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Api { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_fake_compute_operation_errors_surface_on_poll() {
        let compute = FakeCompute::new();
        compute.fail_operation("reserve_address", "QUOTA_EXCEEDED: no addresses left");
        let op = compute.reserve_address("a-ip").await.unwrap();
        assert!(!op.is_done());
        let done = compute.get_operation(&op).await.unwrap();
        assert_eq!(done.error.as_deref(), Some("QUOTA_EXCEEDED: no addresses left"));
        assert!(compute.addresses().is_empty());
    }
}
