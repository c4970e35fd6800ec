//! Frame-control byte and direction.
//!
//! ```text
//! bit 0  ENCRYPTED     bit 4  FRAGMENT
//! bit 1  CHECKSUM      bit 5  WIDE_LENGTH
//! bit 2  TO_CLIENT     bit 6  REPLY
//! bit 3  REQUIRE_ACK   bit 7  CONTINUES
//! ```

use serde::{Deserialize, Serialize};

/// Which way a frame travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Client (phone, host) to device
    ToDevice,
    /// Device to client
    ToClient,
}

impl Direction {
    /// Index used for per-direction state (0 or 1)
    pub fn index(self) -> usize {
        match self {
            Self::ToDevice => 0,
            Self::ToClient => 1,
        }
    }

    /// The other direction
    pub fn opposite(self) -> Self {
        match self {
            Self::ToDevice => Self::ToClient,
            Self::ToClient => Self::ToDevice,
        }
    }
}

/// Frame-control byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameControl(u8);

impl FrameControl {
    /// Body is ciphertext followed by the AEAD tag
    pub const ENCRYPTED: u8 = 1 << 0;
    /// CRC-32 trailer present
    pub const CHECKSUM: u8 = 1 << 1;
    /// Device-to-client frame
    pub const TO_CLIENT: u8 = 1 << 2;
    /// Sender wants an Ack
    pub const REQUIRE_ACK: u8 = 1 << 3;
    /// More fragments of this message follow
    pub const FRAGMENT: u8 = 1 << 4;
    /// Two-byte length field
    pub const WIDE_LENGTH: u8 = 1 << 5;
    /// Body starts with the sequence number being answered
    pub const REPLY: u8 = 1 << 6;
    /// More reply messages follow for the same request
    pub const CONTINUES: u8 = 1 << 7;

    /// Create new empty flags
    pub fn new() -> Self {
        Self(0)
    }

    /// Create from raw bits
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Get raw bits
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Set a flag
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Set or clear a flag
    pub fn set_if(&mut self, flag: u8, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    /// Clear a flag
    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }

    /// Check if flag is set
    pub fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Direction encoded in the TO_CLIENT bit
    pub fn direction(&self) -> Direction {
        if self.has(Self::TO_CLIENT) {
            Direction::ToClient
        } else {
            Direction::ToDevice
        }
    }

    /// Check flag combinations that can never appear on the wire.
    pub fn validate(&self, expected: Direction) -> Result<(), String> {
        if self.has(Self::CONTINUES) && !self.has(Self::REPLY) {
            return Err("CONTINUES set without REPLY".to_string());
        }
        if self.direction() != expected {
            return Err(format!(
                "direction {:?} where {:?} was expected",
                self.direction(),
                expected
            ));
        }
        Ok(())
    }
}
