//! Remote shell errors.

use std::time::Duration;

/// Result type for remote shell operations.
pub type Result<T> = std::result::Result<T, ShellError>;

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// TCP connect or SSH handshake did not complete.
    #[error("Host {host} is unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("Public key authentication failed for {user}@{host}")]
    AuthRejected { user: String, host: String },

    #[error("Host key for {host} changed: pinned {expected}, presented {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("Command timed out after {after:?}: {command}")]
    Timeout { command: String, after: Duration },

    #[error("SSH session error: {reason}")]
    Session { reason: String },

    #[error("Invalid key: {0}")]
    Key(#[from] crate::keys::KeyError),
}

impl ShellError {
    /// Whether the host could not be reached at all.
    ///
    /// Callers use this to fall back to out-of-band recovery (cloud reset).
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_classification() {
        let err = ShellError::Unreachable {
            host: "100.64.0.9".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(err.is_unreachable());
        assert!(
            !ShellError::Timeout {
                command: "reboot".to_string(),
                after: Duration::from_secs(1)
            }
            .is_unreachable()
        );
    }
}
