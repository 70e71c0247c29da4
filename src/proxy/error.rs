//! Reverse-proxy admin errors.

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Proxy admin API at {host} unreachable: {reason}")]
    Request { host: String, reason: String },

    #[error("Proxy admin API at {host} returned {status}: {message}")]
    Api {
        host: String,
        status: u16,
        message: String,
    },

    /// The current document has a shape we refuse to rewrite.
    #[error("Proxy config document is malformed: {reason}")]
    InvalidDocument { reason: String },

    #[error("Invalid route: {reason}")]
    InvalidRoute { reason: String },
}

impl ProxyError {
    pub(crate) fn invalid_document(reason: impl Into<String>) -> Self {
        Self::InvalidDocument {
            reason: reason.into(),
        }
    }
}
