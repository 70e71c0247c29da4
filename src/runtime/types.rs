//! Request and response shapes for the container control API.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;

/// Where a container engine lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuntimeTarget {
    /// Local control socket.
    Local(PathBuf),
    /// Remote engine reachable over TCP (mesh address).
    Remote { host: String, port: u16 },
}

impl RuntimeTarget {
    pub fn local(config: &RuntimeConfig) -> Self {
        Self::Local(config.socket_path.clone())
    }

    pub fn remote(host: impl Into<String>, config: &RuntimeConfig) -> Self {
        Self::Remote {
            host: host.into(),
            port: config.remote_port,
        }
    }
}

impl fmt::Display for RuntimeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "unix://{}", path.display()),
            Self::Remote { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// Restart policy for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

impl RestartPolicy {
    fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::UnlessStopped => "unless-stopped",
            Self::OnFailure => "on-failure",
        }
    }
}

/// Host port binding for a container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
    pub host_ip: String,
}

/// Network attachment with per-network aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network: String,
    pub aliases: Vec<String>,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub network: Option<NetworkAttachment>,
    pub restart_policy: RestartPolicy,
}

impl ContainerSpec {
    /// Body for `POST /containers/create`.
    pub fn to_create_body(&self) -> Value {
        let exposed: serde_json::Map<String, Value> = self
            .ports
            .iter()
            .map(|p| (format!("{}/tcp", p.container_port), json!({})))
            .collect();

        let mut bindings: serde_json::Map<String, Value> = serde_json::Map::new();
        for p in &self.ports {
            let entry = bindings
                .entry(format!("{}/tcp", p.container_port))
                .or_insert_with(|| json!([]));
            if let Value::Array(list) = entry {
                list.push(json!({
                    "HostIp": p.host_ip,
                    "HostPort": p.host_port.to_string(),
                }));
            }
        }

        let mut host_config = json!({
            "PortBindings": bindings,
            "RestartPolicy": { "Name": self.restart_policy.as_str() },
        });

        let mut body = json!({
            "Image": self.image,
            "Env": self.env,
            "Labels": self.labels,
            "ExposedPorts": exposed,
        });

        if let Some(cmd) = &self.cmd {
            body["Cmd"] = json!(cmd);
        }

        if let Some(net) = &self.network {
            host_config["NetworkMode"] = json!(net.network);
            let mut endpoints = serde_json::Map::new();
            endpoints.insert(net.network.clone(), json!({ "Aliases": net.aliases }));
            body["NetworkingConfig"] = json!({ "EndpointsConfig": endpoints });
        }

        body["HostConfig"] = host_config;
        body
    }
}

/// Output of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContainerState {
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
}

/// Subset of `GET /containers/{id}/json`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContainerInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "State", default)]
    pub state: ContainerState,
    #[serde(rename = "Config", default)]
    pub config: ContainerInfoConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContainerInfoConfig {
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

/// Entry from `GET /containers/json`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

/// Entry from `GET /networks`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NetworkSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// Result of an image or container prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub deleted: usize,
    pub space_reclaimed: u64,
}

impl PruneReport {
    pub(crate) fn from_response(body: &Value, list_key: &str) -> Self {
        Self {
            deleted: body
                .get(list_key)
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0),
            space_reclaimed: body
                .get("SpaceReclaimed")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        }
    }
}

/// Summary of `GET /system/df`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub layers_size: u64,
    pub images: usize,
    pub containers: usize,
    pub volumes: usize,
    pub build_cache_size: u64,
}

impl DiskUsage {
    pub(crate) fn from_response(body: &Value) -> Self {
        let count = |key: &str| {
            body.get(key)
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0)
        };
        let build_cache_size = body
            .get("BuildCache")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.get("Size").and_then(Value::as_u64))
                    .sum()
            })
            .unwrap_or(0);

        Self {
            layers_size: body.get("LayersSize").and_then(Value::as_u64).unwrap_or(0),
            images: count("Images"),
            containers: count("Containers"),
            volumes: count("Volumes"),
            build_cache_size,
        }
    }
}

impl fmt::Display for DiskUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "layers={}B images={} containers={} volumes={} build_cache={}B",
            self.layers_size, self.images, self.containers, self.volumes, self.build_cache_size
        )
    }
}

/// Registry credentials for `push_image`.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    #[serde(rename = "serveraddress")]
    pub server_address: String,
}

/// Split `repo/name:tag` into `(repo/name, tag)`; tag defaults to `latest`.
pub fn split_image_ref(image: &str) -> (&str, &str) {
    let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    if let Some(at) = image[last_slash..].find('@') {
        let idx = last_slash + at;
        return (&image[..idx], &image[idx + 1..]);
    }
    match image[last_slash..].rfind(':') {
        Some(colon) => {
            let idx = last_slash + colon;
            (&image[..idx], &image[idx + 1..])
        }
        None => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_split_image_ref() {
        assert_eq!(split_image_ref("postgres:16-alpine"), ("postgres", "16-alpine"));
        assert_eq!(split_image_ref("nginx"), ("nginx", "latest"));
        assert_eq!(
            split_image_ref("registry.local:5000/team/app:v3"),
            ("registry.local:5000/team/app", "v3")
        );
        assert_eq!(
            split_image_ref("registry.local:5000/team/app"),
            ("registry.local:5000/team/app", "latest")
        );
    }

    #[test]
    fn test_create_body_with_network_and_ports() {
        let spec = ContainerSpec {
            name: "deploy-1-app".to_string(),
            image: "app:1".to_string(),
            env: vec!["A=1".to_string()],
            cmd: None,
            labels: HashMap::from([("owner".to_string(), "d1".to_string())]),
            ports: vec![PortBinding {
                container_port: 8080,
                host_port: 10001,
                host_ip: "0.0.0.0".to_string(),
            }],
            network: Some(NetworkAttachment {
                network: "deploy-1-net".to_string(),
                aliases: vec!["app-1".to_string()],
            }),
            restart_policy: RestartPolicy::UnlessStopped,
        };

        let body = spec.to_create_body();
        assert_eq!(body["Image"], "app:1");
        assert_eq!(body["ExposedPorts"], json!({ "8080/tcp": {} }));
        assert_eq!(
            body["HostConfig"]["PortBindings"]["8080/tcp"],
            json!([{ "HostIp": "0.0.0.0", "HostPort": "10001" }])
        );
        assert_eq!(body["HostConfig"]["RestartPolicy"]["Name"], "unless-stopped");
        assert_eq!(body["HostConfig"]["NetworkMode"], "deploy-1-net");
        assert_eq!(
            body["NetworkingConfig"]["EndpointsConfig"]["deploy-1-net"]["Aliases"],
            json!(["app-1"])
        );
        assert!(body.get("Cmd").is_none());
    }

    #[test]
    fn test_target_display() {
        let target = RuntimeTarget::Remote {
            host: "100.101.102.103".to_string(),
            port: 2375,
        };
        assert_eq!(target.to_string(), "tcp://100.101.102.103:2375");
        let local = RuntimeTarget::Local(PathBuf::from("/var/run/docker.sock"));
        assert_eq!(local.to_string(), "unix:///var/run/docker.sock");
    }

    #[test]
    fn test_disk_usage_from_response() {
        let body = json!({
            "LayersSize": 1024,
            "Images": [{}, {}],
            "Containers": [{}],
            "Volumes": null,
            "BuildCache": [{ "Size": 10 }, { "Size": 5 }],
        });
        let df = DiskUsage::from_response(&body);
        assert_eq!(
            df,
            DiskUsage {
                layers_size: 1024,
                images: 2,
                containers: 1,
                volumes: 0,
                build_cache_size: 15,
            }
        );
    }
}
