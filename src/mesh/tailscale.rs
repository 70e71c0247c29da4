use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::MeshConfig;
use crate::mesh::error::{MeshError, Result};
use crate::mesh::{JoinKey, JoinKeyRequest, MeshApi, MeshDevice};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Deserialize)]
struct KeyResponse {
    id: String,
    key: String,
    #[serde(default)]
    expires: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<MeshDevice>,
}

/// Control-plane client using OAuth client credentials.
pub struct TailscaleClient {
    client: reqwest::Client,
    config: MeshConfig,
    token: Mutex<Option<(SecretString, Instant)>>,
}

impl TailscaleClient {
    pub fn new(config: MeshConfig) -> Result<Self> {
        if !config.has_credentials() {
            return Err(MeshError::MissingCredentials);
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("infracore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MeshError::Request {
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.config.api_base, path)
    }

    fn tailnet_url(&self, path: &str) -> String {
        self.url(&format!(
            "tailnet/{}/{}",
            urlencoding::encode(&self.config.tailnet),
            path
        ))
    }

    fn token_request(&self, id: &str, secret: &SecretString) -> reqwest::RequestBuilder {
        self.client.post(self.url("oauth/token")).form(&[
            ("client_id", id),
            ("client_secret", secret.expose_secret()),
            ("grant_type", "client_credentials"),
        ])
    }

    async fn access_token(&self) -> Result<SecretString> {
        let mut cached = self.token.lock().await;
        if let Some((token, valid_until)) = cached.as_ref()
            && Instant::now() < *valid_until
        {
            return Ok(token.clone());
        }

        let (Some(id), Some(secret)) = (
            self.config.oauth_client_id.as_deref(),
            self.config.oauth_client_secret.as_ref(),
        ) else {
            return Err(MeshError::MissingCredentials);
        };

        let response = self
            .token_request(id, secret)
            .send()
            .await
            .map_err(|e| MeshError::Token {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MeshError::Token {
                reason: format!("{status}: {}", body.trim()),
            });
        }
        let parsed: TokenResponse = response.json().await.map_err(|e| MeshError::Token {
            reason: format!("bad token response: {e}"),
        })?;

        tracing::debug!("Obtained mesh API token");
        let token = SecretString::from(parsed.access_token);
        let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(EXPIRY_MARGIN);
        *cached = Some((token.clone(), Instant::now() + lifetime));
        Ok(token)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| text.trim().to_string());
        Err(MeshError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl MeshApi for TailscaleClient {
    async fn create_join_key(&self, request: &JoinKeyRequest) -> Result<JoinKey> {
        let token = self.access_token().await?;
        let body = json!({
            "capabilities": {
                "devices": {
                    "create": {
                        "reusable": true,
                        "ephemeral": false,
                        "preauthorized": true,
                        "tags": request.tags,
                    }
                }
            },
            "expirySeconds": request.expiry.as_secs(),
            "description": request.description,
        });

        let response = self
            .client
            .post(self.tailnet_url("keys"))
            .bearer_auth(token.expose_secret())
            .json(&body)
            .send()
            .await?;
        let parsed: KeyResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| MeshError::InvalidResponse {
                reason: e.to_string(),
            })?;

        tracing::info!(key_id = %parsed.id, "Minted mesh join key");
        Ok(JoinKey {
            id: parsed.id,
            key: SecretString::from(parsed.key),
            expires: parsed.expires,
        })
    }

    async fn list_devices(&self) -> Result<Vec<MeshDevice>> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.tailnet_url("devices"))
            .bearer_auth(token.expose_secret())
            .send()
            .await?;
        let parsed: DevicesResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| MeshError::InvalidResponse {
                reason: e.to_string(),
            })?;
        Ok(parsed.devices)
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .client
            .delete(self.url(&format!("device/{}", urlencoding::encode(id))))
            .bearer_auth(token.expose_secret())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(device = id, "Mesh device already removed");
            return Ok(());
        }
        Self::check(response).await?;
        tracing::info!(device = id, "Removed mesh device");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_credentials() {
        assert!(matches!(
            TailscaleClient::new(MeshConfig::default()),
            Err(MeshError::MissingCredentials)
        ));
    }

    #[test]
    fn test_token_request_is_form_encoded() {
        let client = TailscaleClient::new(MeshConfig {
            oauth_client_id: Some("k123".to_string()),
            oauth_client_secret: Some(SecretString::from("tskey-client-a&b=c")),
            ..Default::default()
        })
        .unwrap();
        let secret = SecretString::from("tskey-client-a&b=c");
        let request = client.token_request("k123", &secret).build().unwrap();

        assert_eq!(request.url().path(), "/api/v2/oauth/token");
        assert_eq!(
            request.headers()[reqwest::header::CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(
            std::str::from_utf8(body).unwrap(),
            "client_id=k123&client_secret=tskey-client-a%26b%3Dc&grant_type=client_credentials"
        );
    }

    #[test]
    fn test_tailnet_url_encodes_name() {
        let client = TailscaleClient::new(MeshConfig {
            oauth_client_id: Some("k123".to_string()),
            oauth_client_secret: Some(SecretString::from("tskey-client-x")),
            tailnet: "example.com".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.tailnet_url("devices"),
            "https://api.tailscale.com/api/v2/tailnet/example.com/devices"
        );
    }
}
