//! Blufi frame codec.
//!
//! [`FrameCodec`] is the stateful half of the codec: it owns the outgoing
//! sequence counter and the reassembly buffer for one link. The stateless
//! wire functions live in [`frame`].
//!
//! ```text
//! encode: Frame ──split──▶ chunks ──seq──▶ encode_frame × n ──▶ wire frames
//! decode: wire frame ──decode_frame──▶ DecodedFrame ──Reassembler──▶ Message | Fragment
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use blufi::codec::{CodecLimits, Decoded, Direction, DataSubtype, Frame, FrameCodec};
//!
//! let mut client = FrameCodec::new(Direction::ToDevice, CodecLimits::default());
//! let mut device = FrameCodec::new(Direction::ToClient, CodecLimits::default());
//!
//! let encoded = client.encode(Frame::data(DataSubtype::CustomData, &b"hi"[..]), None)?;
//! for bytes in &encoded.frames {
//!     if let Decoded::Message(frame) = device.decode(bytes, None)? {
//!         assert_eq!(frame.payload.as_ref(), b"hi");
//!     }
//! }
//! ```

mod checksum;
mod flags;
pub mod fragment;
pub mod frame;

pub use checksum::{frame_checksum, CHECKSUM_SIZE};
pub use flags::{Direction, FrameControl};
pub use fragment::{Decoded, Reassembler};
pub use frame::{
    decode_frame, encode_frame, ControlSubtype, DataSubtype, DecodedFrame, Frame, FrameKind,
    FrameType,
};

use crate::error::{BlufiError, Result};
use crate::security::SecurityContext;

/// Smallest accepted `max_frame_size`
pub const MIN_FRAME_SIZE: usize = 48;

/// Default `max_frame_size`
pub const DEFAULT_FRAME_SIZE: usize = 128;

/// Default cap on a reassembled message, the most a fragment length can carry
pub const DEFAULT_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Size limits for one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    /// Largest wire frame written to the transport
    pub max_frame_size: usize,
    /// Largest message accepted or produced
    pub max_message_size: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_FRAME_SIZE,
            max_message_size: DEFAULT_MESSAGE_SIZE,
        }
    }
}

/// Wire frames produced for one message
#[derive(Debug, Clone)]
pub struct Encoded {
    /// Sequence number of the first frame
    pub sequence: u8,
    /// Encoded frames, in send order
    pub frames: Vec<Vec<u8>>,
}

/// Stateful encoder/decoder for one side of a link.
#[derive(Debug)]
pub struct FrameCodec {
    outgoing: Direction,
    next_seq: u8,
    limits: CodecLimits,
    reassembler: Reassembler,
}

impl FrameCodec {
    /// Create a codec that sends in `outgoing` direction
    pub fn new(outgoing: Direction, limits: CodecLimits) -> Self {
        Self {
            outgoing,
            next_seq: 0,
            limits,
            reassembler: Reassembler::new(limits.max_message_size),
        }
    }

    /// Client side of a link
    pub fn client(limits: CodecLimits) -> Self {
        Self::new(Direction::ToDevice, limits)
    }

    /// Device side of a link
    pub fn device(limits: CodecLimits) -> Self {
        Self::new(Direction::ToClient, limits)
    }

    /// Sequence number the next encoded frame will use
    pub fn next_sequence(&self) -> u8 {
        self.next_seq
    }

    /// Size limits
    pub fn limits(&self) -> CodecLimits {
        self.limits
    }

    /// Encode a message, fragmenting it if needed.
    ///
    /// The frame's sequence number and direction are assigned here. No
    /// sequence number is consumed when encoding fails.
    pub fn encode(
        &mut self,
        mut frame: Frame,
        mut security: Option<&mut SecurityContext>,
    ) -> Result<Encoded> {
        if frame.encrypted && security.is_none() {
            return Err(BlufiError::NegotiationIncomplete);
        }
        if frame.payload.len() > self.limits.max_message_size {
            return Err(BlufiError::MalformedFrame(format!(
                "message of {} bytes exceeds limit of {}",
                frame.payload.len(),
                self.limits.max_message_size
            )));
        }

        frame.direction = self.outgoing;
        frame.has_fragment = false;
        let parts = fragment::split(frame, self.limits.max_frame_size)?;

        let start = self.next_seq;
        let mut frames = Vec::with_capacity(parts.len());
        let mut seq = start;
        for (mut part, remaining) in parts {
            part.sequence = seq;
            frames.push(encode_frame(&part, remaining, security.as_deref_mut())?);
            seq = seq.wrapping_add(1);
        }
        self.next_seq = seq;

        Ok(Encoded {
            sequence: start,
            frames,
        })
    }

    /// Decode one wire frame.
    ///
    /// A frame that fails to decode also discards any partially reassembled
    /// message.
    pub fn decode(
        &mut self,
        bytes: &[u8],
        security: Option<&mut SecurityContext>,
    ) -> Result<Decoded> {
        let decoded = match decode_frame(bytes, self.outgoing.opposite(), security) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.reassembler.discard();
                return Err(e);
            },
        };
        self.reassembler.push(decoded)
    }

    /// Forget all link state
    pub fn reset(&mut self) {
        self.next_seq = 0;
        self.reassembler.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::KeyExchange;

    fn codecs() -> (FrameCodec, FrameCodec) {
        (
            FrameCodec::client(CodecLimits::default()),
            FrameCodec::device(CodecLimits::default()),
        )
    }

    fn deliver(encoded: &Encoded, rx: &mut FrameCodec, mut ctx: Option<&mut SecurityContext>) -> Frame {
        let mut message = None;
        for bytes in &encoded.frames {
            if let Decoded::Message(frame) = rx.decode(bytes, ctx.as_deref_mut()).unwrap() {
                message = Some(frame);
            }
        }
        message.unwrap()
    }

    #[test]
    fn test_sequence_assignment() {
        let (mut client, _) = codecs();
        let a = client
            .encode(Frame::control(ControlSubtype::GetVersion, bytes::Bytes::new()), None)
            .unwrap();
        let b = client
            .encode(Frame::data(DataSubtype::CustomData, vec![0u8; 300]), None)
            .unwrap();
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert_eq!(client.next_sequence(), 1 + b.frames.len() as u8);
    }

    #[test]
    fn test_failed_encode_keeps_sequence() {
        let (mut client, _) = codecs();
        let frame = Frame::data(DataSubtype::StaConfig, &b"pw"[..]).protected(true, true);
        assert!(matches!(
            client.encode(frame, None),
            Err(BlufiError::NegotiationIncomplete)
        ));
        assert_eq!(client.next_sequence(), 0);
    }

    #[test]
    fn test_fragmented_encrypted_message() {
        let a = KeyExchange::new();
        let b = KeyExchange::new();
        let (a_pk, b_pk) = (*a.public_key(), *b.public_key());
        let mut client_ctx = SecurityContext::establish(a, b_pk, 0).unwrap();
        let mut device_ctx = SecurityContext::establish(b, a_pk, 0).unwrap();

        let (mut client, mut device) = codecs();
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let frame = Frame::data(DataSubtype::CustomData, payload.clone()).protected(true, true);

        let encoded = client.encode(frame, Some(&mut client_ctx)).unwrap();
        assert!(encoded.frames.len() > 1);
        assert!(encoded
            .frames
            .iter()
            .all(|f| f.len() <= DEFAULT_FRAME_SIZE));

        let message = deliver(&encoded, &mut device, Some(&mut device_ctx));
        assert_eq!(message.payload.as_ref(), payload.as_slice());
        assert_eq!(message.sequence, encoded.sequence);
        assert!(message.encrypted);
    }

    #[test]
    fn test_sequence_wraps() {
        let (mut client, mut device) = codecs();
        for i in 0..300u32 {
            let encoded = client
                .encode(Frame::data(DataSubtype::CustomData, vec![i as u8]), None)
                .unwrap();
            assert_eq!(encoded.sequence, (i % 256) as u8);
            let message = deliver(&encoded, &mut device, None);
            assert_eq!(message.payload.as_ref(), &[i as u8]);
        }
    }

    #[test]
    fn test_corrupt_fragment_discards_partial() {
        let (mut client, mut device) = codecs();
        let frame = Frame::data(DataSubtype::CustomData, vec![7u8; 400]).protected(false, true);
        let mut encoded = client.encode(frame, None).unwrap();
        assert!(encoded.frames.len() >= 3);

        device.decode(&encoded.frames[0], None).unwrap();
        encoded.frames[1][6] ^= 0x01;
        assert!(matches!(
            device.decode(&encoded.frames[1], None),
            Err(BlufiError::ChecksumMismatch { .. })
        ));
        assert!(!device.reassembler.in_progress());
    }

    #[test]
    fn test_oversized_message_refused() {
        let mut client = FrameCodec::client(CodecLimits {
            max_frame_size: 64,
            max_message_size: 100,
        });
        assert!(client
            .encode(Frame::data(DataSubtype::CustomData, vec![0u8; 101]), None)
            .is_err());
    }
}
