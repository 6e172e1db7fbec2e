//! Binary codec for Telelink frames.
//!
//! Wire format (see [`crate::protocol::frame`] for the field table):
//! ```text
//! [serial:16][tid:2][type:1][len:2][ack:1][health:1][iv:8][reserved:1][ciphertext:len]
//! ```
//! Total header size: 32 bytes.  All multi-byte integers are little-endian.
//!
//! Decoding is incremental: [`decode_frame`] returns `None` until the whole
//! frame is buffered and reports how many bytes it consumed, so a reader can
//! drain its buffer without ever producing the same frame twice.

use thiserror::Error;

use crate::protocol::frame::{Frame, BLOCK_SIZE, HEADER_SIZE, IV_LEN, SERIAL_LEN};

/// Errors raised while building an outbound frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The serial is not exactly 16 bytes.
    #[error("serial must be {SERIAL_LEN} bytes, got {0}")]
    InvalidSerial(usize),

    /// The ciphertext does not fit the 16-bit length field.
    #[error("payload of {0} bytes exceeds the 65535-byte frame limit")]
    PayloadTooLarge(usize),

    /// Non-empty ciphertext must be a whole number of cipher blocks.
    #[error("payload length {0} is not a multiple of {BLOCK_SIZE}")]
    MisalignedPayload(usize),
}

/// Errors raised while interpreting an inbound frame.
///
/// None of these close the connection; the offending frame is logged and
/// dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message type byte is not a recognised value.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// The frame was addressed to a different device.
    #[error("serial mismatch: expected {expected}, got {actual}")]
    SerialMismatch { expected: String, actual: String },

    /// Non-empty ciphertext that is not block-aligned.
    #[error("payload length {0} is not a multiple of {BLOCK_SIZE}")]
    MisalignedPayload(usize),

    /// The decrypted payload text could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `frame` into its header followed by the ciphertext.
///
/// # Errors
///
/// Returns [`FrameError`] if the payload is too long or not block-aligned.
///
/// # Examples
///
/// ```rust
/// use telelink_core::protocol::{decode_frame, encode_frame, Frame, MessageType};
///
/// let frame = Frame::new(b"SN00000000000001", 42, MessageType::Keepalive, [0; 8], Vec::new())
///     .unwrap();
/// let bytes = encode_frame(&frame).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let len = frame.payload.len();
    if len > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge(len));
    }
    if len % BLOCK_SIZE != 0 {
        return Err(FrameError::MisalignedPayload(len));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + len);
    buf.extend_from_slice(&frame.serial);
    buf.extend_from_slice(&frame.transaction_id.to_le_bytes());
    buf.push(frame.message_type);
    buf.extend_from_slice(&(len as u16).to_le_bytes());
    buf.push(u8::from(frame.ack));
    buf.push(frame.health);
    buf.extend_from_slice(&frame.iv);
    buf.push(0x00); // reserved
    debug_assert_eq!(buf.len(), HEADER_SIZE);

    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

/// Decodes one frame from the start of `bytes`.
///
/// Returns the frame and the number of bytes it occupied, or `None` while
/// fewer than `32 + payload_length` bytes are available.
pub fn decode_frame(bytes: &[u8]) -> Option<(Frame, usize)> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }

    let payload_len = read_u16(bytes, 19) as usize;
    let total = HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return None;
    }

    let mut serial = [0u8; SERIAL_LEN];
    serial.copy_from_slice(&bytes[0..SERIAL_LEN]);
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&bytes[23..23 + IV_LEN]);

    let frame = Frame {
        serial,
        transaction_id: read_u16(bytes, 16),
        message_type: bytes[18],
        ack: bytes[21] != 0,
        health: bytes[22],
        iv,
        payload: bytes[HEADER_SIZE..total].to_vec(),
    };
    Some((frame, total))
}

/// Checks the invariants an inbound frame must satisfy before its payload
/// is decrypted.
///
/// # Errors
///
/// Returns [`ProtocolError::SerialMismatch`] or
/// [`ProtocolError::MisalignedPayload`].
pub fn validate_inbound(frame: &Frame, expected_serial: &[u8]) -> Result<(), ProtocolError> {
    if frame.serial[..] != *expected_serial {
        return Err(ProtocolError::SerialMismatch {
            expected: String::from_utf8_lossy(expected_serial).into_owned(),
            actual: frame.serial_lossy(),
        });
    }
    if frame.payload.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::MisalignedPayload(frame.payload.len()));
    }
    Ok(())
}

// ── Primitive helpers ─────────────────────────────────────────────────────────

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::MessageType;

    const SERIAL: &[u8; 16] = b"TL-0000000000042";

    fn data_frame() -> Frame {
        Frame::new(SERIAL, 0xBEEF, MessageType::Data, [7; IV_LEN], vec![0xAA; 24])
            .unwrap()
            .with_health(2)
    }

    #[test]
    fn test_encode_writes_little_endian_header() {
        // Arrange
        let frame = data_frame();

        // Act
        let bytes = encode_frame(&frame).unwrap();

        // Assert
        assert_eq!(&bytes[0..16], SERIAL);
        assert_eq!(&bytes[16..18], &[0xEF, 0xBE], "tid must be little-endian");
        assert_eq!(bytes[18], 1);
        assert_eq!(&bytes[19..21], &[24, 0]);
        assert_eq!(bytes[21], 1, "outbound frames carry the ack flag");
        assert_eq!(bytes[22], 2);
        assert_eq!(&bytes[23..31], &[7; 8]);
        assert_eq!(bytes[31], 0, "reserved byte must be zero");
        assert_eq!(bytes.len(), HEADER_SIZE + 24);
    }

    #[test]
    fn test_nack_frame_clears_ack_byte() {
        let bytes = encode_frame(&data_frame().nack()).unwrap();
        assert_eq!(bytes[21], 0);
        let (decoded, _) = decode_frame(&bytes).unwrap();
        assert!(!decoded.ack);
    }

    #[test]
    fn test_encode_rejects_misaligned_payload() {
        let mut frame = data_frame();
        frame.payload = vec![1; 13];
        assert_eq!(encode_frame(&frame), Err(FrameError::MisalignedPayload(13)));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut frame = data_frame();
        frame.payload = vec![1; 65_536];
        assert_eq!(encode_frame(&frame), Err(FrameError::PayloadTooLarge(65_536)));
    }

    #[test]
    fn test_decode_returns_none_on_partial_header() {
        let bytes = encode_frame(&data_frame()).unwrap();
        assert!(decode_frame(&bytes[..HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn test_decode_returns_none_on_partial_payload() {
        let bytes = encode_frame(&data_frame()).unwrap();
        assert!(decode_frame(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn test_decode_consumes_exactly_one_frame() {
        // Arrange – two frames back to back in one buffer
        let first = data_frame();
        let second = Frame::new(SERIAL, 3, MessageType::Ack, [0; IV_LEN], Vec::new()).unwrap();
        let mut buf = encode_frame(&first).unwrap();
        buf.extend(encode_frame(&second).unwrap());

        // Act
        let (a, used_a) = decode_frame(&buf).unwrap();
        let (b, used_b) = decode_frame(&buf[used_a..]).unwrap();

        // Assert
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert_eq!(used_a + used_b, buf.len());
    }

    #[test]
    fn test_decode_keeps_unknown_message_type() {
        let mut bytes = encode_frame(&data_frame()).unwrap();
        bytes[18] = 0x42;
        let (frame, _) = decode_frame(&bytes).unwrap();
        assert_eq!(frame.kind(), Err(ProtocolError::UnknownMessageType(0x42)));
    }

    #[test]
    fn test_validate_inbound_detects_serial_mismatch() {
        let frame = data_frame();
        let err = validate_inbound(&frame, b"TL-9999999999999").unwrap_err();
        assert!(matches!(err, ProtocolError::SerialMismatch { .. }));
    }

    #[test]
    fn test_validate_inbound_detects_misaligned_payload() {
        let mut frame = data_frame();
        frame.payload.truncate(20);
        assert_eq!(
            validate_inbound(&frame, SERIAL),
            Err(ProtocolError::MisalignedPayload(20))
        );
    }

    #[test]
    fn test_validate_inbound_accepts_matching_frame() {
        assert_eq!(validate_inbound(&data_frame(), SERIAL), Ok(()));
    }
}
