//! Key codec errors.

/// Result type for key operations.
pub type Result<T> = std::result::Result<T, KeyError>;

/// Failures while decoding or encoding key material.
///
/// Decoding never yields a partial key: any structural mismatch maps to one
/// of these variants.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Key is not PEM-armored OpenSSH: {reason}")]
    Armor { reason: String },

    #[error("Key body is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Key does not start with the openssh-key-v1 magic")]
    BadMagic,

    #[error("Key is encrypted with cipher '{cipher}'; only unencrypted keys are supported")]
    Encrypted { cipher: String },

    #[error("Unsupported key type: {key_type}")]
    UnsupportedKeyType { key_type: String },

    #[error("Expected exactly one key, found {count}")]
    KeyCount { count: u32 },

    #[error("Private section check integers differ ({first:#010x} != {second:#010x})")]
    CheckMismatch { first: u32, second: u32 },

    #[error("Malformed key: {reason}")]
    Malformed { reason: String },
}

impl KeyError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}
