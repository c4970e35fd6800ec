//! X25519 key exchange used by the Negotiate data frames.
//!
//! Each negotiation uses a fresh [`KeyExchange`]. Its private scalar never
//! leaves the value and is wiped when [`KeyExchange::finish`] consumes it.

use std::fmt;

use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use super::keys::KeyMaterial;
use super::PUBLIC_KEY_SIZE;

/// Errors from key exchange operations
#[derive(Debug, Error)]
pub enum KeyExchangeError {
    /// Peer key has the wrong length
    #[error("Public key must be {PUBLIC_KEY_SIZE} bytes, got {0}")]
    BadLength(usize),

    /// The peer key produced an all-zero shared secret
    #[error("Peer public key is a low-order point")]
    NonContributory,
}

/// X25519 public key as carried in a Negotiate frame
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a key of exactly [`PUBLIC_KEY_SIZE`] bytes
    pub fn from_slice(slice: &[u8]) -> Result<Self, KeyExchangeError> {
        <[u8; PUBLIC_KEY_SIZE]>::try_from(slice)
            .map(Self)
            .map_err(|_| KeyExchangeError::BadLength(slice.len()))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

// First four bytes only.
impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, ..] = self.0;
        write!(f, "PublicKey({a:02x}{b:02x}{c:02x}{d:02x}..)")
    }
}

/// Our half of one negotiation
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyExchange {
    /// Fresh random key pair
    pub fn new() -> Self {
        Self::from_static(StaticSecret::random_from_rng(OsRng))
    }

    /// Deterministic key pair from a fixed scalar, for test vectors
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self::from_static(StaticSecret::from(secret))
    }

    fn from_static(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// Key to send to the peer
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Combine with the peer's key into the raw shared secret.
    ///
    /// Low-order peer keys are refused: they would pin the secret to zero
    /// regardless of our scalar.
    pub fn finish(self, peer: &PublicKey) -> Result<KeyMaterial, KeyExchangeError> {
        let shared = self.secret.diffie_hellman(&X25519Public::from(peer.0));
        if !shared.was_contributory() {
            return Err(KeyExchangeError::NonContributory);
        }
        Ok(KeyMaterial::new(shared.as_bytes().to_vec()))
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
