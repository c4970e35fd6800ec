//! Security session for Blufi frames.
//!
//! # Negotiation
//!
//! ```text
//! Client                                   Device
//!    |--- Negotiate [0x01][pk_c:32] ------->|   begin_negotiation()
//!    |<-- Negotiate [0x01][pk_d:32] --------|
//!    |  complete_negotiation(pk_d)          |
//!    |--- SetSecurityMode (encrypted) ----->|
//!    |<-- Ack (encrypted) ------------------|   session Ready
//! ```
//!
//! ```text
//! shared_secret   = X25519(sk_c, pk_d) = X25519(sk_d, pk_c)
//! okm[36]         = HKDF-SHA256(shared_secret, "blufi/v1/session-keys")
//! symmetric key   = okm[0..32]   (ChaCha20-Poly1305)
//! checksum key    = okm[32..36]  (CRC-32 seed of encrypted frames)
//! ```
//!
//! # Renegotiation
//!
//! [`SecuritySession`] keeps the active [`SecurityContext`] untouched while a
//! new exchange is in flight. Completing the exchange builds the replacement
//! context first and installs it with a single assignment, so no frame is
//! ever encrypted with a half-replaced key.

mod cipher;
mod error;
mod exchange;
mod keys;
mod mode;

pub use cipher::{CipherError, FrameCipher, FrameCounter};
pub use error::CryptoError;
pub use exchange::{KeyExchange, KeyExchangeError, PublicKey};
pub use keys::{KeyError, KeyMaterial, SessionKeys, SESSION_KEY_INFO};
pub use mode::{FrameProtection, SecurityMode};

use crate::codec::Direction;
use crate::error::{BlufiError, Result};

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 key size
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Checksum key size (CRC-32 seed)
pub const CHECKSUM_KEY_SIZE: usize = 4;

/// Nonce size for ChaCha20-Poly1305 (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for ChaCha20-Poly1305 (128 bits)
pub const AEAD_TAG_SIZE: usize = 16;

/// Keys and cipher state of one completed negotiation.
#[derive(Debug)]
pub struct SecurityContext {
    local_public: PublicKey,
    remote_public: PublicKey,
    cipher: FrameCipher,
    checksum_seed: u32,
    generation: u32,
}

impl SecurityContext {
    /// Finish an exchange against the peer's public key and derive keys.
    pub fn establish(
        exchange: KeyExchange,
        remote_public: PublicKey,
        generation: u32,
    ) -> std::result::Result<Self, CryptoError> {
        let local_public = *exchange.public_key();
        let shared_secret = exchange.finish(&remote_public)?;
        let keys = SessionKeys::derive(&shared_secret)?;

        Ok(Self {
            local_public,
            remote_public,
            cipher: FrameCipher::new(&keys.symmetric)?,
            checksum_seed: keys.checksum_seed()?,
            generation,
        })
    }

    /// Our public key for this context
    pub fn local_public_key(&self) -> &PublicKey {
        &self.local_public
    }

    /// The peer's public key for this context
    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_public
    }

    /// CRC-32 seed for encrypted frames
    pub fn checksum_seed(&self) -> u32 {
        self.checksum_seed
    }

    /// How many negotiations preceded this one in the session
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Encrypt a frame body
    pub fn encrypt(
        &mut self,
        direction: Direction,
        seq: u8,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        Ok(self
            .cipher
            .encrypt(direction, seq, aad, plaintext)
            .map_err(CryptoError::from)?)
    }

    /// Decrypt a frame body
    pub fn decrypt(
        &mut self,
        direction: Direction,
        seq: u8,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        Ok(self
            .cipher
            .decrypt(direction, seq, aad, ciphertext)
            .map_err(CryptoError::from)?)
    }
}

/// Negotiation state owned by one protocol session.
#[derive(Debug, Default)]
pub struct SecuritySession {
    pending: Option<KeyExchange>,
    active: Option<SecurityContext>,
    generation: u32,
}

impl SecuritySession {
    /// Create a session with no keys
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a key exchange and return the public key to send.
    ///
    /// Any earlier unfinished exchange is discarded; the active context (if
    /// any) stays in place until [`complete_negotiation`](Self::complete_negotiation).
    pub fn begin_negotiation(&mut self) -> PublicKey {
        let exchange = KeyExchange::new();
        let public = *exchange.public_key();
        self.pending = Some(exchange);
        public
    }

    /// Finish the exchange with the peer's public key and install the new
    /// context atomically.
    pub fn complete_negotiation(&mut self, remote_public: PublicKey) -> Result<()> {
        let exchange = self.pending.take().ok_or_else(|| {
            BlufiError::NegotiationFailed("no key exchange in progress".to_string())
        })?;

        let context = SecurityContext::establish(exchange, remote_public, self.generation)
            .map_err(|e| BlufiError::NegotiationFailed(e.to_string()))?;

        self.generation += 1;
        self.active = Some(context);
        tracing::debug!(generation = self.generation, "security context installed");
        Ok(())
    }

    /// Drop an unfinished exchange, keeping the active context.
    pub fn abort_negotiation(&mut self) {
        self.pending = None;
    }

    /// Drop all key material.
    pub fn reset(&mut self) {
        self.pending = None;
        self.active = None;
    }

    /// Whether a completed context is installed
    pub fn is_negotiated(&self) -> bool {
        self.active.is_some()
    }

    /// Whether an exchange is in flight
    pub fn is_negotiating(&self) -> bool {
        self.pending.is_some()
    }

    /// The active context, if negotiated
    pub fn context(&self) -> Option<&SecurityContext> {
        self.active.as_ref()
    }

    /// The active context, or `NegotiationIncomplete`
    pub fn context_mut(&mut self) -> Result<&mut SecurityContext> {
        self.active.as_mut().ok_or(BlufiError::NegotiationIncomplete)
    }

    /// Encrypt with the active context
    pub fn encrypt(
        &mut self,
        direction: Direction,
        seq: u8,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        self.context_mut()?.encrypt(direction, seq, aad, plaintext)
    }

    /// Decrypt with the active context
    pub fn decrypt(
        &mut self,
        direction: Direction,
        seq: u8,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        self.context_mut()?.decrypt(direction, seq, aad, ciphertext)
    }
}
