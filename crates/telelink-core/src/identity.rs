//! Connection identity: serial, shared key and server address.
//!
//! An [`Identity`] is validated once when it is built and is immutable for
//! the life of the connection that owns it.

use std::fmt;

use thiserror::Error;

use crate::protocol::frame::SERIAL_LEN;

/// Length of the shared symmetric key in bytes.
pub const KEY_LEN: usize = 16;

/// Construction-time validation failures.  These are fatal: the caller must
/// fix its configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("serial must be {SERIAL_LEN} ASCII characters, got {0} bytes")]
    InvalidSerial(usize),
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    InvalidKey(usize),
    #[error("server host must not be empty")]
    EmptyHost,
    #[error("server port must be non-zero")]
    InvalidPort,
}

/// Who this device is and where it reports to.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    serial: [u8; SERIAL_LEN],
    key: [u8; KEY_LEN],
    host: String,
    port: u16,
}

impl Identity {
    /// Validates and builds an identity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the serial is not 16 ASCII
    /// characters, the key is not 16 bytes, the host is empty or the port
    /// is zero.
    pub fn new(
        serial: &str,
        key: &[u8],
        host: impl Into<String>,
        port: u16,
    ) -> Result<Self, ConfigurationError> {
        if !serial.is_ascii() || serial.len() != SERIAL_LEN {
            return Err(ConfigurationError::InvalidSerial(serial.len()));
        }
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| ConfigurationError::InvalidKey(key.len()))?;
        let host = host.into();
        if host.trim().is_empty() {
            return Err(ConfigurationError::EmptyHost);
        }
        if port == 0 {
            return Err(ConfigurationError::InvalidPort);
        }

        let mut serial_bytes = [0u8; SERIAL_LEN];
        serial_bytes.copy_from_slice(serial.as_bytes());
        Ok(Self {
            serial: serial_bytes,
            key,
            host,
            port,
        })
    }

    pub fn serial(&self) -> &[u8; SERIAL_LEN] {
        &self.serial
    }

    /// Serial as text.  Always valid: construction only accepts ASCII.
    pub fn serial_str(&self) -> &str {
        std::str::from_utf8(&self.serial).unwrap_or_default()
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// The key never reaches a log line.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("serial", &self.serial_str())
            .field("key", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_accepts_valid_identity() {
        let id = Identity::new("TL-0000000000042", b"0123456789abcdef", "example.net", 7000)
            .unwrap();
        assert_eq!(id.serial_str(), "TL-0000000000042");
        assert_eq!(id.server_addr(), "example.net:7000");
    }

    #[test]
    fn test_new_rejects_wrong_serial_length() {
        assert_eq!(
            Identity::new("SHORT", b"0123456789abcdef", "h", 1),
            Err(ConfigurationError::InvalidSerial(5))
        );
    }

    #[test]
    fn test_new_rejects_non_ascii_serial() {
        let serial = "TL-00000000000é"; // 16 bytes, not ASCII
        assert_eq!(serial.len(), 16);
        assert!(matches!(
            Identity::new(serial, b"0123456789abcdef", "h", 1),
            Err(ConfigurationError::InvalidSerial(_))
        ));
    }

    #[test]
    fn test_new_rejects_wrong_key_length() {
        assert_eq!(
            Identity::new("TL-0000000000042", b"short", "h", 1),
            Err(ConfigurationError::InvalidKey(5))
        );
    }

    #[test]
    fn test_new_rejects_empty_host_and_zero_port() {
        assert_eq!(
            Identity::new("TL-0000000000042", b"0123456789abcdef", " ", 1),
            Err(ConfigurationError::EmptyHost)
        );
        assert_eq!(
            Identity::new("TL-0000000000042", b"0123456789abcdef", "h", 0),
            Err(ConfigurationError::InvalidPort)
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let id = Identity::new("TL-0000000000042", b"0123456789abcdef", "h", 1).unwrap();
        let text = format!("{id:?}");
        assert!(!text.contains("0123456789abcdef"));
        assert!(text.contains("<redacted>"));
    }
}
