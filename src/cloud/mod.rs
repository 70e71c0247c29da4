//! Cloud compute API client.
//!
//! Mutating calls return a long-running [`Operation`]; callers poll it with
//! [`wait_for_operation`] until it is done. Instance operations are zonal,
//! address operations regional.

mod error;
mod gce;
mod startup;
mod token;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

pub use error::{CloudError, Result};
pub use gce::GceClient;
pub use startup::StartupScript;
pub use token::{
    AccessTokenProvider, MetadataTokenProvider, StaticTokenProvider, token_provider_from_config,
};

/// Where an operation lives, which decides its polling path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationScope {
    Zone(String),
    Region(String),
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
}

/// A long-running cloud operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub scope: OperationScope,
    pub status: OperationStatus,
    /// Joined `error.errors[].message`, present only on failure.
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct RawOperation {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    error: Option<RawOperationError>,
}

#[derive(Deserialize)]
struct RawOperationError {
    #[serde(default)]
    errors: Vec<RawErrorEntry>,
}

#[derive(Deserialize)]
struct RawErrorEntry {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn last_segment(url: &str) -> String {
    url.rsplit('/').next().unwrap_or(url).to_string()
}

impl Operation {
    /// Parse an operation resource.
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawOperation =
            serde_json::from_value(value).map_err(|e| CloudError::InvalidResponse {
                reason: format!("not an operation: {e}"),
            })?;

        let scope = match (raw.zone, raw.region) {
            (Some(zone), _) => OperationScope::Zone(last_segment(&zone)),
            (None, Some(region)) => OperationScope::Region(last_segment(&region)),
            (None, None) => OperationScope::Global,
        };
        let status = match raw.status.as_str() {
            "DONE" => OperationStatus::Done,
            "RUNNING" => OperationStatus::Running,
            _ => OperationStatus::Pending,
        };
        let error = raw.error.and_then(|e| {
            let messages: Vec<String> = e
                .errors
                .into_iter()
                .filter_map(|entry| match (entry.code, entry.message) {
                    (Some(code), Some(msg)) => Some(format!("{code}: {msg}")),
                    (None, Some(msg)) => Some(msg),
                    (Some(code), None) => Some(code),
                    (None, None) => None,
                })
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        });

        Ok(Self {
            name: raw.name,
            scope,
            status,
            error,
        })
    }

    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }
}

/// Instance creation parameters.
#[derive(Debug, Clone, Default)]
pub struct InstanceRequest {
    pub name: String,
    pub machine_type: String,
    pub source_image: String,
    pub disk_size_gb: u32,
    /// Reserved static address to attach, or ephemeral when `None`.
    pub nat_ip: Option<String>,
    pub startup_script: String,
    /// `user:ssh-ed25519 AAAA... comment` lines.
    pub ssh_keys: Option<String>,
    pub network_tags: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl InstanceRequest {
    /// Body for `POST zones/{zone}/instances`.
    pub fn to_body(&self, zone: &str) -> Value {
        let mut access_config = json!({
            "type": "ONE_TO_ONE_NAT",
            "name": "External NAT",
        });
        if let Some(ip) = &self.nat_ip {
            access_config["natIP"] = json!(ip);
        }

        let mut metadata = vec![json!({ "key": "startup-script", "value": self.startup_script })];
        if let Some(keys) = &self.ssh_keys {
            metadata.push(json!({ "key": "ssh-keys", "value": keys }));
        }

        json!({
            "name": self.name,
            "machineType": format!("zones/{}/machineTypes/{}", zone, self.machine_type),
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": self.source_image,
                    "diskSizeGb": self.disk_size_gb.to_string(),
                },
            }],
            "networkInterfaces": [{
                "network": "global/networks/default",
                "accessConfigs": [access_config],
            }],
            "metadata": { "items": metadata },
            "tags": { "items": self.network_tags },
            "labels": self.labels,
        })
    }
}

/// Observed instance attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub name: String,
    /// `PROVISIONING`, `RUNNING`, `TERMINATED`, ...
    pub status: String,
    pub external_ip: Option<String>,
}

impl InstanceInfo {
    pub(crate) fn from_value(value: &Value) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| CloudError::InvalidResponse {
                reason: "instance without a name".to_string(),
            })?
            .to_string();
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let external_ip = value
            .pointer("/networkInterfaces/0/accessConfigs/0/natIP")
            .and_then(Value::as_str)
            .map(String::from);
        Ok(Self {
            name,
            status,
            external_ip,
        })
    }
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn insert_instance(&self, request: &InstanceRequest) -> Result<Operation>;

    /// `None` when the instance does not exist.
    async fn get_instance(&self, name: &str) -> Result<Option<InstanceInfo>>;

    async fn start_instance(&self, name: &str) -> Result<Operation>;

    async fn stop_instance(&self, name: &str) -> Result<Operation>;

    /// Hard reset, used when the guest is unreachable.
    async fn reset_instance(&self, name: &str) -> Result<Operation>;

    /// `None` when the instance was already gone.
    async fn delete_instance(&self, name: &str) -> Result<Option<Operation>>;

    /// Reserve a regional static external address under `name`.
    async fn reserve_address(&self, name: &str) -> Result<Operation>;

    /// The reserved IP, `None` when no such reservation exists.
    async fn get_address(&self, name: &str) -> Result<Option<String>>;

    /// `None` when the reservation was already gone.
    async fn release_address(&self, name: &str) -> Result<Option<Operation>>;

    /// Refresh an operation's status.
    async fn get_operation(&self, operation: &Operation) -> Result<Operation>;
}

/// Poll `operation` until it is done, then surface its error if any.
pub async fn wait_for_operation(
    api: &dyn ComputeApi,
    operation: Operation,
    interval: Duration,
    max_polls: u32,
) -> Result<Operation> {
    let mut current = operation;
    let mut polls = 0;
    while !current.is_done() {
        if polls >= max_polls {
            return Err(CloudError::OperationTimeout {
                name: current.name,
                polls,
            });
        }
        tokio::time::sleep(interval).await;
        current = api.get_operation(&current).await?;
        polls += 1;
        tracing::debug!(operation = %current.name, polls, status = ?current.status, "Polled operation");
    }

    match current.error.take() {
        Some(message) => Err(CloudError::OperationFailed {
            name: current.name,
            message,
        }),
        None => Ok(current),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_zonal_operation_with_errors() {
        let op = Operation::from_value(json!({
            "name": "operation-1699-abc",
            "status": "DONE",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a",
            "error": { "errors": [
                { "code": "ZONE_RESOURCE_POOL_EXHAUSTED", "message": "The zone does not have enough resources" }
            ]}
        }))
        .unwrap();
        assert_eq!(op.scope, OperationScope::Zone("us-central1-a".to_string()));
        assert!(op.is_done());
        assert_eq!(
            op.error.as_deref(),
            Some("ZONE_RESOURCE_POOL_EXHAUSTED: The zone does not have enough resources")
        );
    }

    #[test]
    fn test_parse_regional_operation() {
        let op = Operation::from_value(json!({
            "name": "operation-2",
            "status": "RUNNING",
            "region": "https://www.googleapis.com/compute/v1/projects/p/regions/us-central1",
        }))
        .unwrap();
        assert_eq!(op.scope, OperationScope::Region("us-central1".to_string()));
        assert_eq!(op.status, OperationStatus::Running);
        assert!(op.error.is_none());
    }

    #[test]
    fn test_instance_body() {
        let request = InstanceRequest {
            name: "infra-1".to_string(),
            machine_type: "e2-medium".to_string(),
            source_image: "projects/debian-cloud/global/images/family/debian-12".to_string(),
            disk_size_gb: 30,
            nat_ip: Some("34.1.2.3".to_string()),
            startup_script: "#!/bin/bash".to_string(),
            ssh_keys: Some("infra:ssh-ed25519 AAAA c".to_string()),
            network_tags: vec!["http-server".to_string()],
            labels: HashMap::new(),
        };
        let body = request.to_body("us-central1-a");
        assert_eq!(body["machineType"], "zones/us-central1-a/machineTypes/e2-medium");
        assert_eq!(
            body["networkInterfaces"][0]["accessConfigs"][0]["natIP"],
            "34.1.2.3"
        );
        assert_eq!(body["metadata"]["items"][1]["key"], "ssh-keys");
        assert_eq!(body["disks"][0]["initializeParams"]["diskSizeGb"], "30");
    }

    #[test]
    fn test_instance_info_external_ip() {
        let info = InstanceInfo::from_value(&json!({
            "name": "infra-1",
            "status": "RUNNING",
            "networkInterfaces": [{ "accessConfigs": [{ "natIP": "34.1.2.3" }] }]
        }))
        .unwrap();
        assert_eq!(info.external_ip.as_deref(), Some("34.1.2.3"));
    }
}
