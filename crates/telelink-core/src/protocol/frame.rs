//! Frame layout and message type codes.
//!
//! Every frame starts with a 32-byte header.  Multi-byte integers are
//! little-endian.
//!
//! ```text
//! offset  size  field
//!      0    16  serial (ASCII)
//!     16     2  transaction_id
//!     18     1  message_type
//!     19     2  payload_length
//!     21     1  ack_flag (1, or 0 for a negative acknowledgement)
//!     22     1  health (0-3)
//!     23     8  iv (zero when the payload is empty)
//!     31     1  reserved, always zero
//!     32     N  ciphertext
//! ```

use crate::protocol::codec::{FrameError, ProtocolError};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Total size of the frame header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Length of the device serial carried in every header.
pub const SERIAL_LEN: usize = 16;

/// Length of the CBC initialisation vector stored in the header.
pub const IV_LEN: usize = 8;

/// Cipher block size; non-empty payloads are always a multiple of this.
pub const BLOCK_SIZE: usize = 8;

/// Highest health value a frame may carry.
pub const MAX_HEALTH: u8 = 3;

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes understood by the device.
///
/// Types 1–3 are device-originated reports, 4–7 are server requests, and
/// 8–9 are link-level frames with empty payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Data = 1,
    LogData = 2,
    Setup = 3,
    DataRequest = 4,
    SetupChange = 5,
    LogPrepare = 6,
    LogSendRequest = 7,
    Keepalive = 8,
    Ack = 9,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(MessageType::Data),
            2 => Ok(MessageType::LogData),
            3 => Ok(MessageType::Setup),
            4 => Ok(MessageType::DataRequest),
            5 => Ok(MessageType::SetupChange),
            6 => Ok(MessageType::LogPrepare),
            7 => Ok(MessageType::LogSendRequest),
            8 => Ok(MessageType::Keepalive),
            9 => Ok(MessageType::Ack),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded unit of wire data: header fields plus ciphertext.
///
/// `message_type` is kept as the raw byte so frames with an unknown type can
/// still be extracted from the stream and reported; use [`Frame::kind`] for
/// the typed view.
///
/// The IV travels in header bytes 23..31, which older peers treat as
/// reserved and ignore.  Such a peer decrypts with the wrong IV, which only
/// garbles the first plaintext block.  That block is the random filler
/// [`CryptoBox`](crate::crypto::CryptoBox) discards, so the payload text
/// still comes through intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub serial: [u8; SERIAL_LEN],
    pub transaction_id: u16,
    pub message_type: u8,
    pub ack: bool,
    pub health: u8,
    pub iv: [u8; IV_LEN],
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds an outbound frame.  The ack flag is set; use
    /// [`Frame::nack`] to clear it.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidSerial`] if `serial` is not exactly
    /// [`SERIAL_LEN`] bytes long.
    pub fn new(
        serial: &[u8],
        transaction_id: u16,
        kind: MessageType,
        iv: [u8; IV_LEN],
        payload: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let serial: [u8; SERIAL_LEN] = serial
            .try_into()
            .map_err(|_| FrameError::InvalidSerial(serial.len()))?;
        Ok(Self {
            serial,
            transaction_id,
            message_type: kind as u8,
            ack: true,
            health: 0,
            iv,
            payload,
        })
    }

    /// Clears the ack flag, marking a negative acknowledgement.
    pub fn nack(mut self) -> Self {
        self.ack = false;
        self
    }

    /// Sets the health byte, clamped to [`MAX_HEALTH`].
    pub fn with_health(mut self, health: u8) -> Self {
        self.health = health.min(MAX_HEALTH);
        self
    }

    /// Typed message kind.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownMessageType`] for codes outside 1–9.
    pub fn kind(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.message_type)
    }

    /// Serial as text, lossy for non-UTF-8 bytes.  Used in log lines.
    pub fn serial_lossy(&self) -> String {
        String::from_utf8_lossy(&self.serial).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_try_from_covers_all_codes() {
        for code in 1u8..=9 {
            let kind = MessageType::try_from(code).expect("known code");
            assert_eq!(kind as u8, code);
        }
    }

    #[test]
    fn test_message_type_try_from_rejects_unknown() {
        assert_eq!(
            MessageType::try_from(0),
            Err(ProtocolError::UnknownMessageType(0))
        );
        assert_eq!(
            MessageType::try_from(10),
            Err(ProtocolError::UnknownMessageType(10))
        );
    }

    #[test]
    fn test_frame_new_rejects_short_serial() {
        let result = Frame::new(b"SHORT", 1, MessageType::Data, [0; IV_LEN], Vec::new());
        assert_eq!(result, Err(FrameError::InvalidSerial(5)));
    }

    #[test]
    fn test_frame_new_sets_ack_flag_on_every_type() {
        for code in 1u8..=9 {
            let kind = MessageType::try_from(code).unwrap();
            let frame = Frame::new(b"ABCDEFGHIJKLMNOP", 7, kind, [0; IV_LEN], Vec::new()).unwrap();
            assert!(frame.ack, "{kind:?} must carry the ack flag");
        }
    }

    #[test]
    fn test_nack_clears_ack_flag() {
        let frame = Frame::new(b"ABCDEFGHIJKLMNOP", 7, MessageType::Ack, [0; IV_LEN], Vec::new())
            .unwrap()
            .nack();
        assert!(!frame.ack);
    }

    #[test]
    fn test_with_health_clamps_to_three() {
        let frame = Frame::new(b"ABCDEFGHIJKLMNOP", 1, MessageType::Keepalive, [0; IV_LEN], Vec::new())
            .unwrap()
            .with_health(9);
        assert_eq!(frame.health, MAX_HEALTH);
    }
}
