//! ChaCha20-Poly1305 frame cipher with sequence-derived nonces.
//!
//! ```text
//! nonce = [direction:1][0:3][counter:8 LE]     counter = epoch << 8 | seq
//! ```
//!
//! `epoch` counts how many times the 8-bit sequence number of a direction
//! has wrapped, so every frame of a session gets a distinct nonce as long
//! as frames are encrypted and decrypted in sequence order.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use thiserror::Error;

use super::keys::KeyMaterial;
use super::{AEAD_TAG_SIZE, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::codec::Direction;

/// Errors from frame encryption
#[derive(Debug, Error)]
pub enum CipherError {
    /// Invalid key
    #[error("Invalid cipher key: {0}")]
    InvalidKey(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (auth tag mismatch, corrupted data or wrong order)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Ciphertext shorter than the auth tag
    #[error("Ciphertext too short")]
    DataTooShort,
}

/// Tracks sequence wraps for one direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCounter {
    epoch: u64,
    last: Option<u8>,
}

impl FrameCounter {
    /// Advance to `seq` and return its 64-bit counter.
    ///
    /// A sequence number not greater than the previous one starts a new
    /// epoch.
    pub fn advance(&mut self, seq: u8) -> u64 {
        if matches!(self.last, Some(last) if seq <= last) {
            self.epoch += 1;
        }
        self.last = Some(seq);
        (self.epoch << 8) | u64::from(seq)
    }

    /// Counter the next call to [`advance`](Self::advance) would return.
    pub fn peek(&self, seq: u8) -> u64 {
        let epoch = match self.last {
            Some(last) if seq <= last => self.epoch + 1,
            _ => self.epoch,
        };
        (epoch << 8) | u64::from(seq)
    }
}

/// Frame cipher bound to one symmetric key.
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
    counters: [FrameCounter; 2],
}

impl FrameCipher {
    /// Create a cipher from a 32-byte key
    pub fn new(key: &KeyMaterial) -> Result<Self, CipherError> {
        let key_bytes: [u8; SYMMETRIC_KEY_SIZE] = key.as_bytes().try_into().map_err(|_| {
            CipherError::InvalidKey(format!(
                "Expected {} bytes, got {}",
                SYMMETRIC_KEY_SIZE,
                key.len()
            ))
        })?;

        Ok(Self {
            cipher: ChaCha20Poly1305::new(&key_bytes.into()),
            counters: [FrameCounter::default(); 2],
        })
    }

    /// Encrypt one frame body. Output is `ciphertext || tag`.
    pub fn encrypt(
        &mut self,
        direction: Direction,
        seq: u8,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let counter = self.counters[direction.index()].advance(seq);
        let nonce = build_nonce(direction, counter);

        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CipherError::EncryptionFailed(e.to_string()))
    }

    /// Decrypt one frame body produced by [`encrypt`](Self::encrypt).
    ///
    /// The counter only advances when authentication succeeds, so a forged
    /// frame cannot desynchronise the nonce sequence.
    pub fn decrypt(
        &mut self,
        direction: Direction,
        seq: u8,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < AEAD_TAG_SIZE {
            return Err(CipherError::DataTooShort);
        }

        let counter = self.counters[direction.index()].peek(seq);
        let nonce = build_nonce(direction, counter);

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|e| CipherError::DecryptionFailed(e.to_string()))?;

        self.counters[direction.index()].advance(seq);
        Ok(plaintext)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher")
            .field("key", &"[REDACTED]")
            .field("counters", &self.counters)
            .finish()
    }
}

fn build_nonce(direction: Direction, counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0] = direction.index() as u8;
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (FrameCipher, FrameCipher) {
        let key = KeyMaterial::new(vec![0x42; 32]);
        (FrameCipher::new(&key).unwrap(), FrameCipher::new(&key).unwrap())
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (mut tx, mut rx) = pair();
        let ct = tx
            .encrypt(Direction::ToDevice, 7, b"hdr", b"Hello, device")
            .unwrap();
        assert_eq!(ct.len(), 13 + AEAD_TAG_SIZE);

        let pt = rx.decrypt(Direction::ToDevice, 7, b"hdr", &ct).unwrap();
        assert_eq!(pt, b"Hello, device");
    }

    #[test]
    fn test_wrong_aad_rejected() {
        let (mut tx, mut rx) = pair();
        let ct = tx.encrypt(Direction::ToDevice, 1, b"a", b"data").unwrap();
        assert!(rx.decrypt(Direction::ToDevice, 1, b"b", &ct).is_err());
    }

    #[test]
    fn test_nonce_differs_per_direction() {
        let (mut a, mut b) = pair();
        let to_device = a.encrypt(Direction::ToDevice, 0, b"", b"same").unwrap();
        let to_client = b.encrypt(Direction::ToClient, 0, b"", b"same").unwrap();
        assert_ne!(to_device, to_client);
    }

    #[test]
    fn test_counter_wraps_into_new_epoch() {
        let mut counter = FrameCounter::default();
        assert_eq!(counter.advance(254), 254);
        assert_eq!(counter.advance(255), 255);
        assert_eq!(counter.peek(0), 256);
        assert_eq!(counter.advance(0), 256);
        assert_eq!(counter.advance(1), 257);
    }

    #[test]
    fn test_sequence_across_wrap() {
        let (mut tx, mut rx) = pair();
        for i in 0..600u32 {
            let seq = (i % 256) as u8;
            let ct = tx.encrypt(Direction::ToClient, seq, &[seq], b"x").unwrap();
            let pt = rx.decrypt(Direction::ToClient, seq, &[seq], &ct).unwrap();
            assert_eq!(pt, b"x");
        }
    }

    #[test]
    fn test_out_of_order_decrypt_fails() {
        let (mut tx, mut rx) = pair();
        let first = tx.encrypt(Direction::ToClient, 255, b"", b"a").unwrap();
        let second = tx.encrypt(Direction::ToClient, 0, b"", b"b").unwrap();

        // Processing seq 0 before 255 puts the receiver in the wrong epoch.
        assert!(rx.decrypt(Direction::ToClient, 0, b"", &second).is_err());
        assert!(rx.decrypt(Direction::ToClient, 255, b"", &first).is_ok());
        assert!(rx.decrypt(Direction::ToClient, 0, b"", &second).is_ok());
    }

    #[test]
    fn test_short_ciphertext() {
        let (_, mut rx) = pair();
        assert!(matches!(
            rx.decrypt(Direction::ToClient, 0, b"", &[0u8; 4]),
            Err(CipherError::DataTooShort)
        ));
    }
}
