//! Crypto error type shared by the exchange, key derivation and cipher.

use thiserror::Error;

use super::cipher::CipherError;
use super::exchange::KeyExchangeError;
use super::keys::KeyError;

/// Any failure in the security layer. The underlying error stays
/// reachable through `source()`.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Frame sealing or opening failed
    #[error("frame cipher: {0}")]
    Cipher(#[from] CipherError),

    /// Session key derivation failed
    #[error("key derivation: {0}")]
    Key(#[from] KeyError),

    /// X25519 exchange failed
    #[error("key exchange: {0}")]
    Exchange(#[from] KeyExchangeError),
}
