//! Framed wire protocol: 12-byte header, payload, CRC-32 trailer.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! magic:u32 = 0x4E4F5351 ("NOSQ")
//! version:u16 = 1
//! type:u8
//! flags:u8
//! payload_len:i32          0 <= payload_len <= 100 MiB
//! payload: payload_len bytes
//! crc32:u32                CRC-32 of the payload; 0 iff payload is empty
//! ```
//!
//! The decoder validates in order: magic, version, type, payload length,
//! payload completeness, CRC. Every violation is a `PROTOCOL_ERROR`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DbError, DbResult};

/// Frame magic, the ASCII bytes `NOSQ`.
pub const MAGIC: u32 = 0x4E4F_5351;

/// Protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 12;

/// CRC trailer size in bytes.
pub const TRAILER_LEN: usize = 4;

/// Maximum payload size: 100 MiB.
pub const MAX_PAYLOAD_LEN: usize = 100 * 1024 * 1024;

/// Message types understood by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client hello carrying its version string.
    Handshake = 0x01,
    /// Credential presentation.
    Authentication = 0x02,
    /// A JSON command envelope.
    Command = 0x03,
    /// A JSON response envelope.
    Response = 0x04,
    /// A JSON error envelope.
    Error = 0x05,
    /// Liveness probe (empty payload).
    Ping = 0x06,
    /// Liveness reply (empty payload).
    Pong = 0x07,
    /// Reserved for transactional envelopes.
    Transaction = 0x08,
    /// A JSON batch of write operations.
    BulkOperation = 0x09,
    /// Server-initiated event (reserved).
    Notification = 0x0A,
}

impl MessageType {
    /// Parses a raw type byte.
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => Self::Handshake,
            0x02 => Self::Authentication,
            0x03 => Self::Command,
            0x04 => Self::Response,
            0x05 => Self::Error,
            0x06 => Self::Ping,
            0x07 => Self::Pong,
            0x08 => Self::Transaction,
            0x09 => Self::BulkOperation,
            0x0A => Self::Notification,
            _ => return None,
        })
    }

    /// The wire byte for this type.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The 8-bit frame flag set. Unknown bits are preserved on pass-through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is compressed (reserved).
    pub const COMPRESSED: Self = Self(0x01);
    /// Sender requires an acknowledgement (reserved).
    pub const REQUIRE_ACK: Self = Self(0x02);
    /// Payload is encrypted (reserved).
    pub const ENCRYPTED: Self = Self(0x04);
    /// Final frame of a batch (reserved).
    pub const END_OF_BATCH: Self = Self(0x08);

    /// Reconstructs flags from a raw byte, keeping unknown bits.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// The raw byte.
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A single wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The message type byte.
    pub message_type: MessageType,
    /// Frame flags.
    pub flags: FrameFlags,
    /// The payload bytes (UTF-8 JSON for command-family types).
    pub payload: Bytes,
}

impl Frame {
    /// A frame with empty flags.
    #[must_use]
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            flags: FrameFlags::default(),
            payload: payload.into(),
        }
    }

    /// Total encoded size: header + payload + trailer.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + TRAILER_LEN
    }

    /// Serializes the frame into `dst`.
    ///
    /// # Errors
    ///
    /// Returns `PROTOCOL_ERROR` when the payload exceeds [`MAX_PAYLOAD_LEN`].
    pub fn encode(&self, dst: &mut BytesMut) -> DbResult<()> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(DbError::Protocol(format!(
                "payload of {} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit",
                self.payload.len()
            )));
        }
        dst.reserve(self.encoded_len());
        dst.put_u32(MAGIC);
        dst.put_u16(PROTOCOL_VERSION);
        dst.put_u8(self.message_type.as_u8());
        dst.put_u8(self.flags.bits());
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        dst.put_i32(self.payload.len() as i32);
        dst.put_slice(&self.payload);
        dst.put_u32(checksum(&self.payload));
        Ok(())
    }
}

/// CRC-32 (reflected, poly `0xEDB88320`) of the payload; 0 for empty input.
#[must_use]
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        0
    } else {
        crc32fast::hash(payload)
    }
}

/// Attempts to decode one frame from the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed; consumed bytes are only
/// advanced once a complete, valid frame is present.
///
/// # Errors
///
/// Returns `PROTOCOL_ERROR` for bad magic, version, type, length, or
/// CRC, checked in that order.
pub fn decode_frame(src: &mut BytesMut) -> DbResult<Option<Frame>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    // Peek the header without consuming so partial frames stay intact.
    let mut header = &src[..HEADER_LEN];
    let magic = header.get_u32();
    if magic != MAGIC {
        return Err(DbError::Protocol(format!(
            "bad magic 0x{magic:08X}, expected 0x{MAGIC:08X}"
        )));
    }
    let version = header.get_u16();
    if version != PROTOCOL_VERSION {
        return Err(DbError::Protocol(format!(
            "unsupported protocol version {version}"
        )));
    }
    let raw_type = header.get_u8();
    let Some(message_type) = MessageType::from_u8(raw_type) else {
        return Err(DbError::Protocol(format!(
            "unknown message type 0x{raw_type:02x}"
        )));
    };
    let flags = FrameFlags::from_bits(header.get_u8());
    let payload_len = header.get_i32();
    if payload_len < 0 {
        return Err(DbError::Protocol(format!(
            "negative payload length {payload_len}"
        )));
    }
    #[allow(clippy::cast_sign_loss)]
    let payload_len = payload_len as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(DbError::Protocol(format!(
            "payload length {payload_len} exceeds the {MAX_PAYLOAD_LEN} byte limit"
        )));
    }

    let total = HEADER_LEN + payload_len + TRAILER_LEN;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_LEN);
    let payload = src.split_to(payload_len).freeze();
    let transmitted = src.get_u32();
    let expected = checksum(&payload);
    if transmitted != expected {
        return Err(DbError::Protocol(format!(
            "checksum mismatch: got 0x{transmitted:08X}, expected 0x{expected:08X}"
        )));
    }

    Ok(Some(Frame {
        message_type,
        flags,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trip_simple() {
        let frame = Frame::new(MessageType::Command, Bytes::from_static(b"{\"a\":1}"));
        let mut buf = encode(&frame);
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trip_empty_payload_has_zero_crc() {
        let frame = Frame::new(MessageType::Ping, Bytes::new());
        let buf = encode(&frame);
        assert_eq!(&buf[buf.len() - 4..], &[0, 0, 0, 0]);
        let mut buf = buf;
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.message_type, MessageType::Ping);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn incomplete_frames_ask_for_more() {
        let frame = Frame::new(MessageType::Command, Bytes::from_static(b"hello"));
        let full = encode(&frame);
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(decode_frame(&mut partial).unwrap().is_none(), "cut={cut}");
        }
    }

    #[test]
    fn bad_magic_is_protocol_error() {
        let mut buf = encode(&Frame::new(MessageType::Ping, Bytes::new()));
        buf[0] ^= 0xFF;
        let err = decode_frame(&mut buf).unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
        assert!(err.closes_connection());
    }

    #[test]
    fn bad_version_is_protocol_error() {
        let mut buf = encode(&Frame::new(MessageType::Ping, Bytes::new()));
        buf[5] = 9;
        assert!(decode_frame(&mut buf).is_err());
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let mut buf = encode(&Frame::new(MessageType::Ping, Bytes::new()));
        buf[6] = 0x7F;
        assert!(decode_frame(&mut buf).is_err());
    }

    #[test]
    fn negative_length_is_protocol_error() {
        let mut buf = encode(&Frame::new(MessageType::Ping, Bytes::new()));
        buf[8] = 0xFF;
        assert!(decode_frame(&mut buf).is_err());
    }

    #[test]
    fn oversize_length_is_protocol_error() {
        let mut buf = encode(&Frame::new(MessageType::Ping, Bytes::new()));
        let oversize = u32::try_from(MAX_PAYLOAD_LEN + 1).unwrap().to_be_bytes();
        buf[8..12].copy_from_slice(&oversize);
        assert!(decode_frame(&mut buf).is_err());
    }

    #[test]
    fn unknown_flag_bits_are_preserved() {
        let frame = Frame {
            message_type: MessageType::Command,
            flags: FrameFlags::from_bits(0xF0),
            payload: Bytes::from_static(b"x"),
        };
        let mut buf = encode(&frame);
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.flags.bits(), 0xF0);
    }

    #[test]
    fn flag_set_operations() {
        let flags = FrameFlags::COMPRESSED.union(FrameFlags::END_OF_BATCH);
        assert!(flags.contains(FrameFlags::COMPRESSED));
        assert!(flags.contains(FrameFlags::END_OF_BATCH));
        assert!(!flags.contains(FrameFlags::ENCRYPTED));
        assert_eq!(flags.bits(), 0x09);
    }

    #[test]
    fn two_frames_back_to_back() {
        let a = Frame::new(MessageType::Command, Bytes::from_static(b"one"));
        let b = Frame::new(MessageType::Response, Bytes::from_static(b"two"));
        let mut buf = encode(&a);
        b.encode(&mut buf).unwrap();
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), a);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), b);
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            type_byte in 1u8..=10,
            flag_bits in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let frame = Frame {
                message_type: MessageType::from_u8(type_byte).unwrap(),
                flags: FrameFlags::from_bits(flag_bits),
                payload: Bytes::from(payload),
            };
            let mut buf = BytesMut::new();
            frame.encode(&mut buf).unwrap();
            let decoded = decode_frame(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, frame);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_payload_corruption_fails_crc(
            payload in proptest::collection::vec(any::<u8>(), 1..512),
            flip in any::<usize>(),
        ) {
            let frame = Frame::new(MessageType::Command, Bytes::from(payload.clone()));
            let mut buf = BytesMut::new();
            frame.encode(&mut buf).unwrap();
            // Flip one payload byte; the CRC check must reject the frame.
            let idx = HEADER_LEN + (flip % payload.len());
            buf[idx] ^= 0x01;
            prop_assert!(decode_frame(&mut buf).is_err());
        }
    }
}
