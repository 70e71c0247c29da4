use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde_json::{Value, json};

use crate::cloud::error::{CloudError, Result};
use crate::cloud::token::AccessTokenProvider;
use crate::cloud::{ComputeApi, InstanceInfo, InstanceRequest, Operation, OperationScope};
use crate::config::CloudConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Compute Engine v1 client scoped to one project and zone.
pub struct GceClient {
    client: reqwest::Client,
    api_base: String,
    project: String,
    zone: String,
    region: String,
    tokens: Box<dyn AccessTokenProvider>,
}

impl GceClient {
    pub fn new(config: &CloudConfig, tokens: Box<dyn AccessTokenProvider>) -> Result<Self> {
        let project = config.require_project()?.to_string();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("infracore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CloudError::Request {
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            project,
            zone: config.zone.clone(),
            region: config.region().to_string(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/projects/{}/{}", self.api_base, self.project, path)
    }

    fn zonal(&self, path: &str) -> String {
        self.url(&format!("zones/{}/{}", self.zone, path))
    }

    fn regional(&self, path: &str) -> String {
        self.url(&format!("regions/{}/{}", self.region, path))
    }

    /// Send a request; `Ok(None)` on 404.
    async fn call(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let token = self.tokens.access_token().await?;
        tracing::debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(token.expose_secret());
        request = match body {
            Some(body) => request.json(body),
            // POST actions with no body still need a length
            None => request.header(reqwest::header::CONTENT_LENGTH, "0"),
        };

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CloudError::Api {
                status: status.as_u16(),
                message: api_error_message(&text),
            });
        }
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| CloudError::InvalidResponse {
                reason: format!("{e}: {text}"),
            })
    }

    async fn call_required(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Value> {
        self.call(method, url, body)
            .await?
            .ok_or_else(|| CloudError::Api {
                status: 404,
                message: format!("{url} not found"),
            })
    }

    async fn instance_action(&self, name: &str, action: &str) -> Result<Operation> {
        let url = self.zonal(&format!("instances/{}/{}", name, action));
        Operation::from_value(self.call_required(Method::POST, &url, None).await?)
    }
}

/// `{"error": {"message": ...}}`, or the raw text.
fn api_error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| text.trim().to_string())
}

#[async_trait]
impl ComputeApi for GceClient {
    async fn insert_instance(&self, request: &InstanceRequest) -> Result<Operation> {
        let url = self.zonal("instances");
        let body = request.to_body(&self.zone);
        tracing::info!(instance = %request.name, zone = %self.zone, "Creating instance");
        Operation::from_value(self.call_required(Method::POST, &url, Some(&body)).await?)
    }

    async fn get_instance(&self, name: &str) -> Result<Option<InstanceInfo>> {
        let url = self.zonal(&format!("instances/{}", name));
        match self.call(Method::GET, &url, None).await? {
            Some(value) => InstanceInfo::from_value(&value).map(Some),
            None => Ok(None),
        }
    }

    async fn start_instance(&self, name: &str) -> Result<Operation> {
        self.instance_action(name, "start").await
    }

    async fn stop_instance(&self, name: &str) -> Result<Operation> {
        self.instance_action(name, "stop").await
    }

    async fn reset_instance(&self, name: &str) -> Result<Operation> {
        self.instance_action(name, "reset").await
    }

    async fn delete_instance(&self, name: &str) -> Result<Option<Operation>> {
        let url = self.zonal(&format!("instances/{}", name));
        self.call(Method::DELETE, &url, None)
            .await?
            .map(Operation::from_value)
            .transpose()
    }

    async fn reserve_address(&self, name: &str) -> Result<Operation> {
        let url = self.regional("addresses");
        let body = json!({ "name": name, "addressType": "EXTERNAL" });
        Operation::from_value(self.call_required(Method::POST, &url, Some(&body)).await?)
    }

    async fn get_address(&self, name: &str) -> Result<Option<String>> {
        let url = self.regional(&format!("addresses/{}", name));
        Ok(self
            .call(Method::GET, &url, None)
            .await?
            .and_then(|v| v.get("address").and_then(Value::as_str).map(String::from)))
    }

    async fn release_address(&self, name: &str) -> Result<Option<Operation>> {
        let url = self.regional(&format!("addresses/{}", name));
        self.call(Method::DELETE, &url, None)
            .await?
            .map(Operation::from_value)
            .transpose()
    }

    async fn get_operation(&self, operation: &Operation) -> Result<Operation> {
        let url = match &operation.scope {
            OperationScope::Zone(zone) => {
                self.url(&format!("zones/{}/operations/{}", zone, operation.name))
            }
            OperationScope::Region(region) => {
                self.url(&format!("regions/{}/operations/{}", region, operation.name))
            }
            OperationScope::Global => self.url(&format!("global/operations/{}", operation.name)),
        };
        Operation::from_value(self.call_required(Method::GET, &url, None).await?)
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::cloud::StaticTokenProvider;

    fn client() -> GceClient {
        let config = CloudConfig {
            project: Some("acme-prod".to_string()),
            zone: "us-east1-b".to_string(),
            ..Default::default()
        };
        GceClient::new(
            &config,
            Box::new(StaticTokenProvider::new(SecretString::from("t"))),
        )
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let c = client();
        assert_eq!(
            c.zonal("instances/infra-1/reset"),
            "https://compute.googleapis.com/compute/v1/projects/acme-prod/zones/us-east1-b/instances/infra-1/reset"
        );
        assert_eq!(
            c.regional("addresses"),
            "https://compute.googleapis.com/compute/v1/projects/acme-prod/regions/us-east1/addresses"
        );
    }

    #[test]
    fn test_requires_project() {
        let result = GceClient::new(
            &CloudConfig::default(),
            Box::new(StaticTokenProvider::new(SecretString::from("t"))),
        );
        assert!(matches!(result, Err(CloudError::Config(_))));
    }

    #[test]
    fn test_api_error_message() {
        let text = r#"{"error":{"code":409,"message":"The resource 'infra-1' already exists"}}"#;
        assert_eq!(api_error_message(text), "The resource 'infra-1' already exists");
        assert_eq!(api_error_message("bad gateway\n"), "bad gateway");
    }
}
