//! Security mode carried by the SetSecurityMode control frame.
//!
//! ```text
//! bit 7..4  control frames     bit 3..0  data frames
//!   bit 0 = checksum              bit 1 = encryption
//! ```

use serde::{Deserialize, Serialize};

use crate::codec::FrameType;

/// Protection applied to one class of frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameProtection {
    /// Append a CRC-32 trailer
    pub checksum: bool,
    /// Encrypt the frame body
    pub encrypt: bool,
}

impl FrameProtection {
    /// Checksum and encryption
    pub const FULL: Self = Self {
        checksum: true,
        encrypt: true,
    };

    /// Checksum only, used before keys exist
    pub const CHECKSUM_ONLY: Self = Self {
        checksum: true,
        encrypt: false,
    };

    /// No protection
    pub const NONE: Self = Self {
        checksum: false,
        encrypt: false,
    };

    fn to_nibble(self) -> u8 {
        u8::from(self.checksum) | (u8::from(self.encrypt) << 1)
    }

    fn from_nibble(nibble: u8) -> Self {
        Self {
            checksum: nibble & 0x01 != 0,
            encrypt: nibble & 0x02 != 0,
        }
    }
}

impl Default for FrameProtection {
    fn default() -> Self {
        Self::FULL
    }
}

/// Per-frame-type protection negotiated after key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityMode {
    /// Protection for control frames
    #[serde(default)]
    pub control: FrameProtection,
    /// Protection for data frames
    #[serde(default)]
    pub data: FrameProtection,
}

impl SecurityMode {
    /// Protection that applies to a frame type
    pub fn for_frame(&self, frame_type: FrameType) -> FrameProtection {
        match frame_type {
            FrameType::Control => self.control,
            FrameType::Data => self.data,
        }
    }

    /// Wire encoding
    pub fn to_byte(&self) -> u8 {
        (self.control.to_nibble() << 4) | self.data.to_nibble()
    }

    /// Decode the wire byte
    pub fn from_byte(b: u8) -> Self {
        Self {
            control: FrameProtection::from_nibble(b >> 4),
            data: FrameProtection::from_nibble(b & 0x0F),
        }
    }
}
