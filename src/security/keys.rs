//! Key material and session key derivation.
//!
//! The X25519 shared secret is expanded with HKDF-SHA256 into 36 bytes and
//! split: the first 32 bytes key the frame cipher, the last 4 seed the
//! frame checksum of encrypted frames.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CHECKSUM_KEY_SIZE, SYMMETRIC_KEY_SIZE};

/// HKDF info string binding derived keys to this protocol version.
pub const SESSION_KEY_INFO: &[u8] = b"blufi/v1/session-keys";

/// Errors from key handling
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key has the wrong length
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// HKDF expansion failed
    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),
}

/// Key material (secret bytes), wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Create new key material from bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Expand this secret with HKDF-SHA256.
    pub fn derive(&self, info: &[u8], output_len: usize) -> Result<KeyMaterial, KeyError> {
        let hk = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut okm = vec![0u8; output_len];

        hk.expand(info, &mut okm)
            .map_err(|e| KeyError::DerivationFailed(format!("HKDF expand failed: {}", e)))?;

        Ok(KeyMaterial::new(okm))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED, {} bytes])", self.bytes.len())
    }
}

/// The two keys split out of a negotiated shared secret.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    /// ChaCha20-Poly1305 key
    pub symmetric: KeyMaterial,
    /// Seed for the CRC-32 of encrypted frames
    pub checksum: KeyMaterial,
}

impl SessionKeys {
    /// Derive both keys from the raw shared secret.
    pub fn derive(shared_secret: &KeyMaterial) -> Result<Self, KeyError> {
        let okm = shared_secret.derive(SESSION_KEY_INFO, SYMMETRIC_KEY_SIZE + CHECKSUM_KEY_SIZE)?;
        let (symmetric, checksum) = okm.as_bytes().split_at(SYMMETRIC_KEY_SIZE);

        Ok(Self {
            symmetric: KeyMaterial::new(symmetric.to_vec()),
            checksum: KeyMaterial::new(checksum.to_vec()),
        })
    }

    /// Checksum key as the CRC-32 initial value.
    pub fn checksum_seed(&self) -> Result<u32, KeyError> {
        let bytes: [u8; CHECKSUM_KEY_SIZE] =
            self.checksum
                .as_bytes()
                .try_into()
                .map_err(|_| KeyError::InvalidLength {
                    expected: CHECKSUM_KEY_SIZE,
                    actual: self.checksum.len(),
                })?;
        Ok(u32::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_key_material_debug_redacted() {
        let key = KeyMaterial::new(vec![0xAB; 32]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("ab"));
    }

    #[test]
    fn test_derive_deterministic() {
        let ikm = KeyMaterial::new(hex!("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b").to_vec());
        let a = ikm.derive(b"info", 42).unwrap();
        let b = ikm.derive(b"info", 42).unwrap();
        assert_eq!(a.len(), 42);
        assert_eq!(a.as_bytes(), b.as_bytes());

        let other = ikm.derive(b"other", 42).unwrap();
        assert_ne!(a.as_bytes(), other.as_bytes());
    }

    #[test]
    fn test_session_keys_split() {
        let secret = KeyMaterial::new(vec![0x42; 32]);
        let keys = SessionKeys::derive(&secret).unwrap();

        assert_eq!(keys.symmetric.len(), SYMMETRIC_KEY_SIZE);
        assert_eq!(keys.checksum.len(), CHECKSUM_KEY_SIZE);
        assert_ne!(&keys.symmetric.as_bytes()[..4], keys.checksum.as_bytes());

        let again = SessionKeys::derive(&secret).unwrap();
        assert_eq!(keys.checksum_seed().unwrap(), again.checksum_seed().unwrap());
    }

    #[test]
    fn test_derive_too_long_fails() {
        let secret = KeyMaterial::new(vec![1; 32]);
        // HKDF-SHA256 caps output at 255 * 32 bytes
        assert!(secret.derive(b"x", 255 * 32 + 1).is_err());
    }
}
