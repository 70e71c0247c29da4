use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ProxyConfig;
use crate::proxy::ProxyAdmin;
use crate::proxy::error::{ProxyError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Admin API client for a Caddy instance on each VM.
pub struct CaddyAdminClient {
    client: reqwest::Client,
    admin_port: u16,
}

impl CaddyAdminClient {
    pub fn new(config: &ProxyConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            admin_port: config.admin_port,
        }
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.admin_port, path)
    }

    async fn send(&self, host: &str, request: reqwest::RequestBuilder) -> Result<String> {
        let response = request.send().await.map_err(|e| ProxyError::Request {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| ProxyError::Request {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| text.trim().to_string());
            return Err(ProxyError::Api {
                host: host.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl ProxyAdmin for CaddyAdminClient {
    async fn get_config(&self, host: &str) -> Result<Value> {
        let request = self.client.get(self.url(host, "/config/"));
        let text = self.send(host, request).await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ProxyError::invalid_document(e.to_string()))
    }

    async fn load_config(&self, host: &str, document: &Value) -> Result<()> {
        tracing::debug!(host, "Loading proxy config");
        let request = self.client.post(self.url(host, "/load")).json(document);
        self.send(host, request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url() {
        let client = CaddyAdminClient::new(&ProxyConfig::default());
        assert_eq!(client.url("100.64.0.3", "/load"), "http://100.64.0.3:2019/load");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_request_error() {
        let client = CaddyAdminClient::new(&ProxyConfig {
            admin_port: 1,
            ..Default::default()
        });
        let err = client.get_config("127.0.0.1").await.unwrap_err();
        assert!(matches!(err, ProxyError::Request { .. }));
    }
}
