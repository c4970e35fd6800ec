//! Blufi frame encoding and decoding.
//!
//! # Wire Format
//!
//! ```text
//! [type:1][fc:1][seq:1][len:1|2][body:len][crc32:4]?
//!
//! type  = subtype << 2 | frame_type          (0 control, 1 data)
//! body  = [reply_to:1]? [remaining:2 LE]? [payload]     (plaintext view)
//! ```
//!
//! When ENCRYPTED is set the body on the wire is the ChaCha20-Poly1305
//! ciphertext of the plaintext view, with `[type, fc, seq]` as associated
//! data. The checksum covers every byte before it.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::checksum::{frame_checksum, CHECKSUM_SIZE};
use super::flags::{Direction, FrameControl};
use crate::error::{BlufiError, Result};
use crate::security::{SecurityContext, AEAD_TAG_SIZE};

/// `[type][fc][seq]`
pub const HEADER_SIZE: usize = 3;

/// Smallest well-formed frame: header plus a one-byte length
pub const MIN_FRAME_LEN: usize = HEADER_SIZE + 1;

/// Largest subtype that fits the 6-bit field
pub const MAX_SUBTYPE: u8 = 0x3F;

/// Frame class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    /// Control frames carry commands and acks
    Control = 0,
    /// Data frames carry values
    Data = 1,
}

impl FrameType {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Control),
            1 => Some(Self::Data),
            _ => None,
        }
    }
}

/// Control frame subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ControlSubtype {
    Ack = 0,
    SetSecurityMode = 1,
    SetOpMode = 2,
    ConnectWifi = 3,
    DisconnectWifi = 4,
    GetWifiStatus = 5,
    Deauthenticate = 6,
    GetVersion = 7,
    CloseConnection = 8,
    GetWifiList = 9,
}

impl ControlSubtype {
    /// Decode a subtype value
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Ack,
            1 => Self::SetSecurityMode,
            2 => Self::SetOpMode,
            3 => Self::ConnectWifi,
            4 => Self::DisconnectWifi,
            5 => Self::GetWifiStatus,
            6 => Self::Deauthenticate,
            7 => Self::GetVersion,
            8 => Self::CloseConnection,
            9 => Self::GetWifiList,
            _ => return None,
        })
    }
}

/// Data frame subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum DataSubtype {
    Negotiate = 0,
    StaBssid = 1,
    StaSsid = 2,
    StaPassword = 3,
    SoftApSsid = 4,
    SoftApPassword = 5,
    SoftApMaxConnections = 6,
    SoftApAuthMode = 7,
    SoftApChannel = 8,
    WifiConnectionState = 15,
    Version = 16,
    WifiList = 17,
    Error = 18,
    CustomData = 19,
    StaMaxConnRetry = 20,
    StaConnEndReason = 21,
    StaConnRssi = 22,
    StaConfig = 23,
}

impl DataSubtype {
    /// Decode a subtype value
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Negotiate,
            1 => Self::StaBssid,
            2 => Self::StaSsid,
            3 => Self::StaPassword,
            4 => Self::SoftApSsid,
            5 => Self::SoftApPassword,
            6 => Self::SoftApMaxConnections,
            7 => Self::SoftApAuthMode,
            8 => Self::SoftApChannel,
            15 => Self::WifiConnectionState,
            16 => Self::Version,
            17 => Self::WifiList,
            18 => Self::Error,
            19 => Self::CustomData,
            20 => Self::StaMaxConnRetry,
            21 => Self::StaConnEndReason,
            22 => Self::StaConnRssi,
            23 => Self::StaConfig,
            _ => return None,
        })
    }
}

/// Frame type plus subtype, the unit replies are matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKind {
    /// Control or data
    pub frame_type: FrameType,
    /// 6-bit subtype
    pub subtype: u8,
}

impl FrameKind {
    /// Control frame kind
    pub const fn control(subtype: ControlSubtype) -> Self {
        Self {
            frame_type: FrameType::Control,
            subtype: subtype as u8,
        }
    }

    /// Data frame kind
    pub const fn data(subtype: DataSubtype) -> Self {
        Self {
            frame_type: FrameType::Data,
            subtype: subtype as u8,
        }
    }

    /// Wire type byte
    pub fn type_byte(&self) -> u8 {
        (self.subtype << 2) | self.frame_type as u8
    }

    /// Parse the wire type byte
    pub fn from_type_byte(b: u8) -> Result<Self> {
        let frame_type = FrameType::from_bits(b & 0x03).ok_or_else(|| {
            BlufiError::MalformedFrame(format!("unknown frame type bits {:#04x}", b & 0x03))
        })?;
        Ok(Self {
            frame_type,
            subtype: b >> 2,
        })
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame_type {
            FrameType::Control => match ControlSubtype::from_byte(self.subtype) {
                Some(s) => write!(f, "control/{:?}", s),
                None => write!(f, "control/{}", self.subtype),
            },
            FrameType::Data => match DataSubtype::from_byte(self.subtype) {
                Some(s) => write!(f, "data/{:?}", s),
                None => write!(f, "data/{}", self.subtype),
            },
        }
    }
}

/// One Blufi frame, or a whole reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Control or data
    pub frame_type: FrameType,
    /// 6-bit subtype
    pub subtype: u8,
    /// Sequence number (first fragment's for reassembled messages)
    pub sequence: u8,
    /// Travel direction
    pub direction: Direction,
    /// Body is encrypted on the wire
    pub encrypted: bool,
    /// CRC-32 trailer present
    pub checksummed: bool,
    /// Sender asks for an Ack
    pub require_ack: bool,
    /// More fragments follow (never set on reassembled messages)
    pub has_fragment: bool,
    /// Sequence number of the request this answers
    pub reply_to: Option<u8>,
    /// More reply messages follow for the same request
    pub continues: bool,
    /// Plaintext payload
    pub payload: Bytes,
}

impl Frame {
    /// New unprotected frame of the given kind
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type: kind.frame_type,
            subtype: kind.subtype,
            sequence: 0,
            direction: Direction::ToDevice,
            encrypted: false,
            checksummed: false,
            require_ack: false,
            has_fragment: false,
            reply_to: None,
            continues: false,
            payload: payload.into(),
        }
    }

    /// Control frame
    pub fn control(subtype: ControlSubtype, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::control(subtype), payload)
    }

    /// Data frame
    pub fn data(subtype: DataSubtype, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::data(subtype), payload)
    }

    /// Set encryption and checksum flags
    pub fn protected(mut self, encrypt: bool, checksum: bool) -> Self {
        self.encrypted = encrypt;
        self.checksummed = checksum;
        self
    }

    /// Mark as a reply to `sequence`
    pub fn reply_to(mut self, sequence: u8) -> Self {
        self.reply_to = Some(sequence);
        self
    }

    /// Mark as a partial reply
    pub fn continued(mut self, continues: bool) -> Self {
        self.continues = continues;
        self
    }

    /// Type and subtype
    pub fn kind(&self) -> FrameKind {
        FrameKind {
            frame_type: self.frame_type,
            subtype: self.subtype,
        }
    }

    /// Control subtype, if this is a known control frame
    pub fn control_subtype(&self) -> Option<ControlSubtype> {
        match self.frame_type {
            FrameType::Control => ControlSubtype::from_byte(self.subtype),
            FrameType::Data => None,
        }
    }

    /// Data subtype, if this is a known data frame
    pub fn data_subtype(&self) -> Option<DataSubtype> {
        match self.frame_type {
            FrameType::Data => DataSubtype::from_byte(self.subtype),
            FrameType::Control => None,
        }
    }

    fn frame_control(&self, fragment: bool, wide: bool) -> FrameControl {
        let mut fc = FrameControl::new();
        fc.set_if(FrameControl::ENCRYPTED, self.encrypted);
        fc.set_if(FrameControl::CHECKSUM, self.checksummed);
        fc.set_if(FrameControl::TO_CLIENT, self.direction == Direction::ToClient);
        fc.set_if(FrameControl::REQUIRE_ACK, self.require_ack);
        fc.set_if(FrameControl::FRAGMENT, fragment);
        fc.set_if(FrameControl::WIDE_LENGTH, wide);
        fc.set_if(FrameControl::REPLY, self.reply_to.is_some());
        fc.set_if(FrameControl::CONTINUES, self.continues);
        fc
    }
}

/// A decoded wire frame with its fragment prefix, if any.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Frame whose payload is this wire frame's chunk
    pub frame: Frame,
    /// Remaining message length announced by a fragment (including this chunk)
    pub remaining: Option<u16>,
}

/// Encode one wire frame.
///
/// `remaining` must be present exactly when `frame.has_fragment` is set.
pub fn encode_frame(
    frame: &Frame,
    remaining: Option<u16>,
    security: Option<&mut SecurityContext>,
) -> Result<Vec<u8>> {
    if frame.subtype > MAX_SUBTYPE {
        return Err(BlufiError::MalformedFrame(format!(
            "subtype {} does not fit in 6 bits",
            frame.subtype
        )));
    }
    if frame.has_fragment != remaining.is_some() {
        return Err(BlufiError::MalformedFrame(
            "fragment flag and remaining length disagree".to_string(),
        ));
    }
    if frame.continues && frame.reply_to.is_none() {
        return Err(BlufiError::MalformedFrame(
            "continued frame is not a reply".to_string(),
        ));
    }

    let mut body = Vec::with_capacity(3 + frame.payload.len());
    if let Some(reply_to) = frame.reply_to {
        body.push(reply_to);
    }
    if let Some(remaining) = remaining {
        body.extend_from_slice(&remaining.to_le_bytes());
    }
    body.extend_from_slice(&frame.payload);

    let body_len = if frame.encrypted {
        body.len() + AEAD_TAG_SIZE
    } else {
        body.len()
    };
    let wide = body_len > usize::from(u8::MAX);
    let body_len = u16::try_from(body_len).map_err(|_| {
        BlufiError::MalformedFrame(format!("frame body of {} bytes is too long", body_len))
    })?;

    let fc = frame.frame_control(remaining.is_some(), wide);
    let header = [frame.kind().type_byte(), fc.bits(), frame.sequence];

    let (body, seed) = if frame.encrypted {
        let ctx = security.ok_or(BlufiError::NegotiationIncomplete)?;
        let ciphertext = ctx.encrypt(frame.direction, frame.sequence, &header, &body)?;
        (ciphertext, ctx.checksum_seed())
    } else {
        (body, 0)
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + 2 + body.len() + CHECKSUM_SIZE);
    buf.extend_from_slice(&header);
    if wide {
        buf.extend_from_slice(&body_len.to_le_bytes());
    } else {
        buf.push(body_len as u8);
    }
    buf.extend_from_slice(&body);

    if frame.checksummed {
        let crc = frame_checksum(seed, &buf);
        buf.extend_from_slice(&crc.to_le_bytes());
    }

    tracing::trace!(kind = %frame.kind(), seq = frame.sequence, len = buf.len(), "encoded frame");
    Ok(buf)
}

/// Decode one wire frame travelling in `expected` direction.
///
/// Checks run in order: header size, frame-control byte, length field,
/// checksum, decryption.
pub fn decode_frame(
    bytes: &[u8],
    expected: Direction,
    mut security: Option<&mut SecurityContext>,
) -> Result<DecodedFrame> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(BlufiError::MalformedFrame(format!(
            "frame too short: {} < {}",
            bytes.len(),
            MIN_FRAME_LEN
        )));
    }

    let kind = FrameKind::from_type_byte(bytes[0])?;
    let fc = FrameControl::from_bits(bytes[1]);
    fc.validate(expected).map_err(BlufiError::MalformedFrame)?;
    let sequence = bytes[2];

    let (body_len, body_start) = if fc.has(FrameControl::WIDE_LENGTH) {
        if bytes.len() < HEADER_SIZE + 2 {
            return Err(BlufiError::MalformedFrame(
                "truncated wide length field".to_string(),
            ));
        }
        (
            usize::from(u16::from_le_bytes([bytes[3], bytes[4]])),
            HEADER_SIZE + 2,
        )
    } else {
        (usize::from(bytes[3]), HEADER_SIZE + 1)
    };

    let trailer = if fc.has(FrameControl::CHECKSUM) {
        CHECKSUM_SIZE
    } else {
        0
    };
    let frame_len = body_start + body_len + trailer;
    if bytes.len() < frame_len {
        return Err(BlufiError::MalformedFrame(format!(
            "truncated frame: length field needs {} bytes, got {}",
            frame_len,
            bytes.len()
        )));
    }
    if bytes.len() > frame_len {
        return Err(BlufiError::MalformedFrame(format!(
            "{} trailing bytes after frame",
            bytes.len() - frame_len
        )));
    }

    let encrypted = fc.has(FrameControl::ENCRYPTED);
    let body_end = body_start + body_len;

    if fc.has(FrameControl::CHECKSUM) {
        let seed = if encrypted {
            security
                .as_deref()
                .ok_or(BlufiError::NegotiationIncomplete)?
                .checksum_seed()
        } else {
            0
        };
        let mut carried = [0u8; CHECKSUM_SIZE];
        carried.copy_from_slice(&bytes[body_end..frame_len]);
        let expected_crc = u32::from_le_bytes(carried);
        let actual = frame_checksum(seed, &bytes[..body_end]);
        if expected_crc != actual {
            return Err(BlufiError::ChecksumMismatch {
                expected: expected_crc,
                actual,
            });
        }
    }

    let body = &bytes[body_start..body_end];
    let plaintext = if encrypted {
        let ctx = security
            .as_deref_mut()
            .ok_or(BlufiError::NegotiationIncomplete)?;
        ctx.decrypt(fc.direction(), sequence, &bytes[..HEADER_SIZE], body)?
    } else {
        body.to_vec()
    };

    let mut pos = 0;
    let reply_to = if fc.has(FrameControl::REPLY) {
        let b = *plaintext
            .first()
            .ok_or_else(|| BlufiError::MalformedFrame("reply frame without reply-to byte".to_string()))?;
        pos += 1;
        Some(b)
    } else {
        None
    };

    let remaining = if fc.has(FrameControl::FRAGMENT) {
        if plaintext.len() < pos + 2 {
            return Err(BlufiError::MalformedFrame(
                "fragment without remaining length".to_string(),
            ));
        }
        let r = u16::from_le_bytes([plaintext[pos], plaintext[pos + 1]]);
        pos += 2;
        Some(r)
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(&plaintext[pos..]);

    tracing::trace!(%kind, seq = sequence, len = bytes.len(), "decoded frame");

    Ok(DecodedFrame {
        frame: Frame {
            frame_type: kind.frame_type,
            subtype: kind.subtype,
            sequence,
            direction: fc.direction(),
            encrypted,
            checksummed: fc.has(FrameControl::CHECKSUM),
            require_ack: fc.has(FrameControl::REQUIRE_ACK),
            has_fragment: fc.has(FrameControl::FRAGMENT),
            reply_to,
            continues: fc.has(FrameControl::CONTINUES),
            payload,
        },
        remaining,
    })
}
