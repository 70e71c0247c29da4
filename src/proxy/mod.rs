//! Reverse-proxy configuration manager.
//!
//! The proxy on each VM holds a single JSON document for every deployment
//! on that VM, and its admin API only accepts whole-document loads. Every
//! edit is therefore read, modify, replace. Edits to the same host are
//! serialized within this process; separate processes must coordinate
//! themselves.

mod caddy;
pub mod document;
mod error;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

pub use caddy::CaddyAdminClient;
pub use error::{ProxyError, Result};

/// DNS-01 challenge settings for certificate issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChallenge {
    /// DNS provider plugin name.
    pub provider: String,
    /// Cloud project hosting the DNS zone.
    pub project: String,
}

/// A domain routed to an upstream `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyRoute {
    pub domain: String,
    pub upstream: String,
}

impl ProxyRoute {
    pub fn new(domain: impl Into<String>, upstream: impl Into<String>) -> Result<Self> {
        let route = Self {
            domain: domain.into().trim().to_ascii_lowercase(),
            upstream: upstream.into(),
        };
        if route.domain.is_empty() || route.domain.contains(['/', ' ', ':']) {
            return Err(ProxyError::InvalidRoute {
                reason: format!("'{}' is not a bare domain name", route.domain),
            });
        }
        if !route.upstream.contains(':') {
            return Err(ProxyError::InvalidRoute {
                reason: format!("upstream '{}' must be host:port", route.upstream),
            });
        }
        Ok(route)
    }
}

/// The proxy's admin API for one host at a time.
#[async_trait]
pub trait ProxyAdmin: Send + Sync {
    /// Current document; `Value::Null` when the proxy has none.
    async fn get_config(&self, host: &str) -> Result<Value>;

    /// Atomically replace the whole document.
    async fn load_config(&self, host: &str, document: &Value) -> Result<()>;
}

pub struct ProxyConfigManager {
    admin: Arc<dyn ProxyAdmin>,
    dns: Option<DnsChallenge>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProxyConfigManager {
    pub fn new(admin: Arc<dyn ProxyAdmin>, dns: Option<DnsChallenge>) -> Self {
        Self {
            admin,
            dns,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn host_lock(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(host.to_string()).or_default())
    }

    /// Read, apply `edit`, write back. Skips the write when `edit` reports
    /// no change.
    async fn edit<F>(&self, host: &str, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut Value) -> Result<bool> + Send,
    {
        let lock = self.host_lock(host);
        let _guard = lock.lock().await;

        let mut document = self.admin.get_config(host).await?;
        if !edit(&mut document)? {
            return Ok(false);
        }
        self.admin.load_config(host, &document).await?;
        Ok(true)
    }

    /// Route `route.domain` to `route.upstream`, replacing any existing route
    /// for that domain.
    pub async fn add_route(&self, host: &str, route: &ProxyRoute) -> Result<()> {
        let dns = self.dns.as_ref();
        self.edit(host, |doc| document::upsert_route(doc, route, dns).map(|_| true))
            .await?;
        tracing::info!(host, domain = %route.domain, upstream = %route.upstream, "Proxy route set");
        Ok(())
    }

    /// Same as [`add_route`](Self::add_route); kept separate for call-site intent.
    pub async fn update_route(&self, host: &str, route: &ProxyRoute) -> Result<()> {
        self.add_route(host, route).await
    }

    /// Remove the route for `domain`. Missing is success.
    pub async fn remove_route(&self, host: &str, domain: &str) -> Result<()> {
        let removed = self
            .edit(host, |doc| document::remove_route(doc, domain))
            .await?;
        if removed {
            tracing::info!(host, domain, "Proxy route removed");
        } else {
            tracing::debug!(host, domain, "No proxy route to remove");
        }
        Ok(())
    }

    pub async fn list_routes(&self, host: &str) -> Result<Vec<ProxyRoute>> {
        let document = self.admin.get_config(host).await?;
        Ok(document::list_routes(&document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProxyAdmin;

    #[test]
    fn test_route_validation() {
        assert!(ProxyRoute::new("App.Example.com ", "127.0.0.1:10000").is_ok());
        assert_eq!(
            ProxyRoute::new("App.Example.com", "127.0.0.1:1").unwrap().domain,
            "app.example.com"
        );
        assert!(ProxyRoute::new("https://a.com", "127.0.0.1:1").is_err());
        assert!(ProxyRoute::new("a.com", "127.0.0.1").is_err());
    }

    #[tokio::test]
    async fn test_remove_missing_does_not_write() {
        let admin = Arc::new(FakeProxyAdmin::new());
        let manager = ProxyConfigManager::new(admin.clone(), None);
        manager.remove_route("h", "nothing.example.com").await.unwrap();
        assert_eq!(admin.loads(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_adds_on_one_host_all_land() {
        let admin = Arc::new(FakeProxyAdmin::new());
        let manager = Arc::new(ProxyConfigManager::new(admin.clone(), None));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                let route =
                    ProxyRoute::new(format!("d{i}.example.com"), format!("127.0.0.1:{}", 10000 + i))
                        .unwrap();
                manager.add_route("vm-1", &route).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(manager.list_routes("vm-1").await.unwrap().len(), 8);
    }
}
