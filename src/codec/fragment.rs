//! Fragmentation and reassembly.
//!
//! A message that does not fit one frame is cut into chunks. Every chunk but
//! the last is sent with FRAGMENT set and a 2-byte remaining-length prefix
//! (bytes from this chunk to the end of the message). Fragments take
//! consecutive sequence numbers.

use bytes::{Bytes, BytesMut};

use super::checksum::CHECKSUM_SIZE;
use super::frame::{DecodedFrame, Frame, FrameKind, HEADER_SIZE};
use crate::error::{BlufiError, Result};
use crate::security::AEAD_TAG_SIZE;

/// Size of the remaining-length prefix of a fragment
pub const FRAGMENT_PREFIX_SIZE: usize = 2;

/// Bytes a frame spends outside its payload, assuming a wide length field.
pub fn frame_overhead(frame: &Frame) -> usize {
    let mut overhead = HEADER_SIZE + 2;
    if frame.checksummed {
        overhead += CHECKSUM_SIZE;
    }
    if frame.encrypted {
        overhead += AEAD_TAG_SIZE;
    }
    if frame.reply_to.is_some() {
        overhead += 1;
    }
    overhead
}

/// Split a message into wire-sized frames with their remaining lengths.
///
/// Sequence numbers are left for the caller to assign.
pub fn split(frame: Frame, max_frame_size: usize) -> Result<Vec<(Frame, Option<u16>)>> {
    let capacity = max_frame_size.saturating_sub(frame_overhead(&frame));
    if frame.payload.len() <= capacity {
        return Ok(vec![(frame, None)]);
    }

    let chunk_size = capacity.saturating_sub(FRAGMENT_PREFIX_SIZE);
    if chunk_size == 0 {
        return Err(BlufiError::MalformedFrame(format!(
            "frame size {} leaves no room for fragment payload",
            max_frame_size
        )));
    }
    let total = u16::try_from(frame.payload.len()).map_err(|_| {
        BlufiError::MalformedFrame(format!(
            "message of {} bytes exceeds the fragment length field",
            frame.payload.len()
        ))
    })?;

    let payload = frame.payload.clone();
    let mut parts = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    let mut offset = 0usize;
    while offset < payload.len() {
        let end = (offset + chunk_size).min(payload.len());
        let last = end == payload.len();
        let mut part = frame.clone();
        part.payload = payload.slice(offset..end);
        part.has_fragment = !last;
        let remaining = if last {
            None
        } else {
            Some(total - offset as u16)
        };
        parts.push((part, remaining));
        offset = end;
    }

    tracing::debug!(
        kind = %frame.kind(),
        len = payload.len(),
        fragments = parts.len(),
        "split message"
    );
    Ok(parts)
}

/// Result of feeding one wire frame to the reassembler
#[derive(Debug, Clone)]
pub enum Decoded {
    /// A complete message
    Message(Frame),
    /// A fragment was buffered; the message is not complete yet
    Fragment {
        /// Bytes buffered so far
        received: usize,
        /// Bytes still expected
        remaining: usize,
    },
}

#[derive(Debug)]
struct Partial {
    head: Frame,
    next_seq: u8,
    expected_remaining: usize,
    buf: BytesMut,
}

/// Joins fragments back into messages.
///
/// Any gap, reordering, kind change or length mismatch discards the partial
/// message and reports `MalformedFrame`.
#[derive(Debug)]
pub struct Reassembler {
    max_message_size: usize,
    partial: Option<Partial>,
}

impl Reassembler {
    /// Create a reassembler that refuses messages larger than `max_message_size`
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            partial: None,
        }
    }

    /// Whether a message is partially buffered
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Kind of the buffered message, if any
    pub fn pending_kind(&self) -> Option<FrameKind> {
        self.partial.as_ref().map(|p| p.head.kind())
    }

    /// Drop any partial message
    pub fn discard(&mut self) {
        if let Some(partial) = self.partial.take() {
            tracing::debug!(
                kind = %partial.head.kind(),
                buffered = partial.buf.len(),
                "discarded partial message"
            );
        }
    }

    /// Feed one decoded wire frame.
    pub fn push(&mut self, decoded: DecodedFrame) -> Result<Decoded> {
        let DecodedFrame { frame, remaining } = decoded;

        let Some(mut partial) = self.partial.take() else {
            return match remaining {
                None => Ok(Decoded::Message(frame)),
                Some(remaining) => self.start(frame, usize::from(remaining)),
            };
        };

        if frame.sequence != partial.next_seq {
            return Err(BlufiError::MalformedFrame(format!(
                "fragment sequence {} where {} was expected",
                frame.sequence, partial.next_seq
            )));
        }
        if frame.kind() != partial.head.kind() {
            return Err(BlufiError::MalformedFrame(format!(
                "fragment kind changed from {} to {}",
                partial.head.kind(),
                frame.kind()
            )));
        }
        if frame.reply_to != partial.head.reply_to {
            return Err(BlufiError::MalformedFrame(
                "fragment reply-to changed mid-message".to_string(),
            ));
        }

        match remaining {
            Some(remaining) => {
                let remaining = usize::from(remaining);
                if remaining != partial.expected_remaining {
                    return Err(BlufiError::MalformedFrame(format!(
                        "fragment announces {} remaining bytes, {} expected",
                        remaining, partial.expected_remaining
                    )));
                }
                if frame.payload.is_empty() || frame.payload.len() >= remaining {
                    return Err(BlufiError::MalformedFrame(
                        "fragment chunk does not leave a tail".to_string(),
                    ));
                }
                partial.buf.extend_from_slice(&frame.payload);
                partial.expected_remaining -= frame.payload.len();
                partial.next_seq = frame.sequence.wrapping_add(1);

                let progress = Decoded::Fragment {
                    received: partial.buf.len(),
                    remaining: partial.expected_remaining,
                };
                self.partial = Some(partial);
                Ok(progress)
            },
            None => {
                if frame.payload.len() != partial.expected_remaining {
                    return Err(BlufiError::MalformedFrame(format!(
                        "final fragment carries {} bytes, {} expected",
                        frame.payload.len(),
                        partial.expected_remaining
                    )));
                }
                partial.buf.extend_from_slice(&frame.payload);

                let mut message = partial.head;
                message.has_fragment = false;
                message.continues = frame.continues;
                message.payload = partial.buf.freeze();
                Ok(Decoded::Message(message))
            },
        }
    }

    fn start(&mut self, frame: Frame, remaining: usize) -> Result<Decoded> {
        if remaining > self.max_message_size {
            return Err(BlufiError::MalformedFrame(format!(
                "message of {} bytes exceeds limit of {}",
                remaining, self.max_message_size
            )));
        }
        if frame.payload.is_empty() || frame.payload.len() >= remaining {
            return Err(BlufiError::MalformedFrame(
                "fragment chunk does not leave a tail".to_string(),
            ));
        }

        let mut buf = BytesMut::with_capacity(remaining);
        buf.extend_from_slice(&frame.payload);
        let expected_remaining = remaining - frame.payload.len();
        let progress = Decoded::Fragment {
            received: buf.len(),
            remaining: expected_remaining,
        };

        self.partial = Some(Partial {
            next_seq: frame.sequence.wrapping_add(1),
            head: Frame {
                payload: Bytes::new(),
                ..frame
            },
            expected_remaining,
            buf,
        });
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame::DataSubtype;

    fn fragments(len: usize, max_frame_size: usize) -> Vec<DecodedFrame> {
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let frame = Frame::data(DataSubtype::CustomData, payload);
        split(frame, max_frame_size)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, (mut frame, remaining))| {
                frame.sequence = i as u8;
                DecodedFrame { frame, remaining }
            })
            .collect()
    }

    #[test]
    fn test_small_message_not_split() {
        let parts = fragments(10, 48);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].remaining.is_none());
    }

    #[test]
    fn test_split_remaining_lengths() {
        // capacity 48 - 5 = 43, chunk 41
        let parts = fragments(100, 48);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].remaining, Some(100));
        assert_eq!(parts[1].remaining, Some(59));
        assert_eq!(parts[2].remaining, None);
        assert_eq!(parts[2].frame.payload.len(), 18);
    }

    #[test]
    fn test_reassemble_in_order() {
        let parts = fragments(200, 48);
        let mut r = Reassembler::new(65536);
        let mut result = None;
        for part in parts {
            match r.push(part).unwrap() {
                Decoded::Message(frame) => result = Some(frame),
                Decoded::Fragment { .. } => assert!(r.in_progress()),
            }
        }
        let message = result.unwrap();
        let expected: Vec<u8> = (0..200).map(|i| i as u8).collect();
        assert_eq!(message.payload.as_ref(), expected.as_slice());
        assert_eq!(message.sequence, 0);
        assert!(!message.has_fragment);
        assert!(!r.in_progress());
    }

    #[test]
    fn test_gap_rejected() {
        let mut parts = fragments(200, 48);
        let mut r = Reassembler::new(65536);
        r.push(parts.remove(0)).unwrap();
        parts.remove(0);
        assert!(matches!(
            r.push(parts.remove(0)),
            Err(BlufiError::MalformedFrame(_))
        ));
        assert!(!r.in_progress());
    }

    #[test]
    fn test_reordered_rejected() {
        let parts = fragments(100, 48);
        let mut r = Reassembler::new(65536);
        r.push(parts[0].clone()).unwrap();
        assert!(r.push(parts[2].clone()).is_err());
    }

    #[test]
    fn test_kind_change_rejected() {
        let mut parts = fragments(100, 48);
        let mut r = Reassembler::new(65536);
        r.push(parts.remove(0)).unwrap();
        parts[0].frame.subtype = DataSubtype::WifiList as u8;
        assert!(r.push(parts.remove(0)).is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let parts = fragments(200, 48);
        let mut r = Reassembler::new(100);
        assert!(matches!(
            r.push(parts[0].clone()),
            Err(BlufiError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_split_needs_room() {
        let frame = Frame::data(DataSubtype::CustomData, vec![0u8; 64]).protected(true, true);
        // overhead = 5 + 4 + 16 = 25, capacity 1, no room for the prefix
        assert!(split(frame, 26).is_err());
    }
}
