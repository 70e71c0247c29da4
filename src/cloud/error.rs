//! Cloud compute API errors.

use crate::error::ConfigError;

/// Result type for cloud operations.
pub type Result<T> = std::result::Result<T, CloudError>;

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Failed to obtain access token: {reason}")]
    Token { reason: String },

    #[error("Cloud API request failed: {reason}")]
    Request { reason: String },

    #[error("Cloud API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// A long-running operation finished with errors.
    #[error("Operation {name} failed: {message}")]
    OperationFailed { name: String, message: String },

    #[error("Operation {name} still running after {polls} polls")]
    OperationTimeout { name: String, polls: u32 },

    #[error("Unexpected cloud API response: {reason}")]
    InvalidResponse { reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// Transport failures and server-side errors worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { .. } | Self::Token { .. } => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request {
            reason: e.to_string(),
        }
    }
}
