//! Bearer tokens for the compute API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::cloud::error::{CloudError, Result};
use crate::config::CloudConfig;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/compute";
/// Refresh this long before the server-reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<SecretString>;
}

/// A fixed token, typically from `CLOUD_ACCESS_TOKEN`.
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<SecretString> {
        Ok(self.token.clone())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// Service-account tokens from the instance metadata server.
pub struct MetadataTokenProvider {
    client: reqwest::Client,
    url: String,
    scopes: Vec<String>,
    cached: Mutex<Option<(SecretString, Instant)>>,
}

impl MetadataTokenProvider {
    pub fn new() -> Self {
        Self::with_url(METADATA_TOKEN_URL)
    }

    pub fn with_url(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.to_string(),
            scopes: vec![COMPUTE_SCOPE.to_string()],
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<(SecretString, Instant)> {
        let scopes = self.scopes.join(",");
        let response = self
            .client
            .get(&self.url)
            .query(&[("scopes", scopes.as_str())])
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| CloudError::Token {
                reason: format!("metadata server unreachable: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Token {
                reason: format!("metadata server returned {status}: {body}"),
            });
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| CloudError::Token {
            reason: format!("bad token response: {e}"),
        })?;
        let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(EXPIRY_MARGIN);
        Ok((
            SecretString::from(parsed.access_token),
            Instant::now() + lifetime,
        ))
    }
}

impl Default for MetadataTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessTokenProvider for MetadataTokenProvider {
    async fn access_token(&self) -> Result<SecretString> {
        let mut cached = self.cached.lock().await;
        if let Some((token, valid_until)) = cached.as_ref()
            && Instant::now() < *valid_until
        {
            return Ok(token.clone());
        }
        tracing::debug!("Fetching compute access token from metadata server");
        let (token, valid_until) = self.fetch().await?;
        *cached = Some((token.clone(), valid_until));
        Ok(token)
    }
}

/// Static token when configured, metadata server otherwise.
pub fn token_provider_from_config(config: &CloudConfig) -> Box<dyn AccessTokenProvider> {
    match &config.access_token {
        Some(token) => Box::new(StaticTokenProvider::new(token.clone())),
        None => Box::new(MetadataTokenProvider::new()),
    }
}
