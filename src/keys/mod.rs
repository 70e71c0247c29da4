//! Ed25519 key material for remote shell access.
//!
//! Keys are generated once per owner. The private half leaves this module
//! only as OpenSSH-armored text wrapped in a [`SecretString`]; callers persist
//! it encrypted. Nothing here touches the filesystem.

mod error;
mod openssh;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::SigningKey;
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};

pub use error::{KeyError, Result};

/// An Ed25519 key pair with its comment.
pub struct KeyPair {
    signing: SigningKey,
    comment: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key_text())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh key pair from the OS random source.
    pub fn generate(comment: impl Into<String>) -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        seed.fill(0);
        Self {
            signing,
            comment: comment.into(),
        }
    }

    pub fn from_signing_key(signing: SigningKey, comment: impl Into<String>) -> Self {
        Self {
            signing,
            comment: comment.into(),
        }
    }

    /// Decode an unencrypted OpenSSH Ed25519 private key.
    ///
    /// The public key stored next to the scalar must match the one derived
    /// from it.
    pub fn decode(private_key_text: &str) -> Result<Self> {
        let raw = openssh::decode(private_key_text)?;
        let signing = SigningKey::from_bytes(&raw.secret);
        if signing.verifying_key().to_bytes() != raw.public {
            return Err(KeyError::malformed(
                "embedded public key does not match the private scalar",
            ));
        }
        Ok(Self {
            signing,
            comment: raw.comment,
        })
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// `ssh-ed25519 <base64> <comment>`, as found in `authorized_keys`.
    pub fn public_key_text(&self) -> String {
        let blob = STANDARD.encode(openssh::public_blob(&self.public_key_bytes()));
        if self.comment.is_empty() {
            format!("{} {}", openssh::KEY_TYPE, blob)
        } else {
            format!("{} {} {}", openssh::KEY_TYPE, blob, self.comment)
        }
    }

    /// OpenSSH-armored private key text.
    pub fn private_key_text(&self) -> SecretString {
        let raw = openssh::RawKey {
            public: self.public_key_bytes(),
            secret: self.signing.to_bytes(),
            comment: self.comment.clone(),
        };
        SecretString::from(openssh::encode(&raw, OsRng.next_u32()))
    }
}

/// Generate a key pair and return `(public_key_text, private_key_text)`.
pub fn generate(comment: &str) -> (String, SecretString) {
    let pair = KeyPair::generate(comment);
    (pair.public_key_text(), pair.private_key_text())
}

/// Derive the public key line from a stored private key.
pub fn public_key_from_private(private_key_text: &SecretString) -> Result<String> {
    KeyPair::decode(private_key_text.expose_secret()).map(|pair| pair.public_key_text())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_decode() {
        let (public, private) = generate("vm-3f2a");
        assert!(public.starts_with("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5"));
        assert!(public.ends_with(" vm-3f2a"));

        let pair = KeyPair::decode(private.expose_secret()).unwrap();
        assert_eq!(pair.comment(), "vm-3f2a");
        assert_eq!(pair.public_key_text(), public);
        assert_eq!(public_key_from_private(&private).unwrap(), public);
    }

    #[test]
    fn test_fixed_seed_is_deterministic_apart_from_check() {
        let signing = SigningKey::from_bytes(&[42u8; 32]);
        let a = KeyPair::from_signing_key(signing.clone(), "");
        let b = KeyPair::decode(a.private_key_text().expose_secret()).unwrap();
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        assert_eq!(b.signing_key().to_bytes(), [42u8; 32]);
        assert!(!a.public_key_text().ends_with(' '));
    }

    #[test]
    fn test_mismatched_public_half_rejected() {
        let raw = openssh::RawKey {
            public: [1u8; 32],
            secret: [42u8; 32],
            comment: String::new(),
        };
        let text = openssh::encode(&raw, 5);
        assert!(matches!(
            KeyPair::decode(&text),
            Err(KeyError::Malformed { .. })
        ));
    }

    #[test]
    fn test_debug_hides_private_half() {
        let pair = KeyPair::generate("c");
        let debug = format!("{:?}", pair);
        assert!(debug.contains("ssh-ed25519"));
        assert!(!debug.contains("OPENSSH PRIVATE KEY"));
    }
}
