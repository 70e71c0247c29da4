//! Mesh control plane errors.

/// Result type for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("Mesh OAuth client credentials are not configured (MESH_OAUTH_CLIENT_ID / MESH_OAUTH_CLIENT_SECRET)")]
    MissingCredentials,

    #[error("Mesh token exchange failed: {reason}")]
    Token { reason: String },

    #[error("Mesh API request failed: {reason}")]
    Request { reason: String },

    #[error("Mesh API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("No device with hostname prefix '{prefix}' joined after {attempts} attempts")]
    DeviceNotFound { prefix: String, attempts: u32 },

    #[error("Unexpected mesh API response: {reason}")]
    InvalidResponse { reason: String },
}

impl From<reqwest::Error> for MeshError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request {
            reason: e.to_string(),
        }
    }
}
