//! Mesh-network control plane client.
//!
//! Used to mint join keys for new VMs, discover the address a VM received
//! after joining, and remove its device on teardown.

mod error;
mod tailscale;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Deserialize;

pub use error::{MeshError, Result};
pub use tailscale::TailscaleClient;

/// Parameters for a device join key.
#[derive(Debug, Clone)]
pub struct JoinKeyRequest {
    pub tags: Vec<String>,
    pub expiry: Duration,
    pub description: String,
}

/// A minted join key.
#[derive(Debug, Clone)]
pub struct JoinKey {
    pub id: String,
    pub key: SecretString,
    pub expires: Option<DateTime<Utc>>,
}

/// A device registered on the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MeshDevice {
    #[serde(default, rename = "nodeId")]
    pub node_id: String,
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    /// Fully-qualified mesh name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl MeshDevice {
    /// The device's IPv4 mesh address.
    pub fn ipv4(&self) -> Option<&str> {
        self.addresses
            .iter()
            .map(String::as_str)
            .find(|a| a.parse::<std::net::Ipv4Addr>().is_ok())
    }
}

#[async_trait]
pub trait MeshApi: Send + Sync {
    /// Mint a reusable, pre-authorized, non-ephemeral join key.
    async fn create_join_key(&self, request: &JoinKeyRequest) -> Result<JoinKey>;

    async fn list_devices(&self) -> Result<Vec<MeshDevice>>;

    /// Remove a device. Missing is success.
    async fn delete_device(&self, id: &str) -> Result<()>;
}

/// First device whose hostname starts with `prefix` and has an IPv4 address.
pub fn find_device<'a>(devices: &'a [MeshDevice], prefix: &str) -> Option<&'a MeshDevice> {
    devices
        .iter()
        .find(|d| d.hostname.starts_with(prefix) && d.ipv4().is_some())
}

/// Every device whose hostname starts with `prefix`, joined or not.
pub fn matching_devices<'a>(
    devices: &'a [MeshDevice],
    prefix: &'a str,
) -> impl Iterator<Item = &'a MeshDevice> {
    devices.iter().filter(move |d| d.hostname.starts_with(prefix))
}

/// Poll the device list until a device matching `prefix` appears.
pub async fn wait_for_device(
    api: &dyn MeshApi,
    prefix: &str,
    attempts: u32,
    delay: Duration,
) -> Result<MeshDevice> {
    for attempt in 1..=attempts {
        let devices = api.list_devices().await?;
        if let Some(device) = find_device(&devices, prefix) {
            tracing::info!(hostname = %device.hostname, attempt, "Device joined the mesh");
            return Ok(device.clone());
        }
        tracing::debug!(prefix, attempt, attempts, "Device not on the mesh yet");
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(MeshError::DeviceNotFound {
        prefix: prefix.to_string(),
        attempts,
    })
}
