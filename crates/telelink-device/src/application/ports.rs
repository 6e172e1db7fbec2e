//! Collaborator interfaces the Device depends on.
//!
//! The Device never touches a socket or a bus directly.  Everything outside
//! its own state is reached through one of these traits:
//!
//! - [`RegisterSource`] – the register/bus access layer (e.g. Modbus).
//! - [`HealthSource`] – reports the 0–3 health value stamped on frames.
//! - [`Link`] – one server connection the Device supervises.
//! - [`MessageHandler`] – the reverse direction: what a connection asks the
//!   Device for when a server request arrives.

use std::collections::HashMap;

use async_trait::async_trait;
use telelink_core::protocol::payload::SetupValues;
use telelink_core::{MessageType, ProtocolError};
use thiserror::Error;

/// Register access failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("register source unavailable: {0}")]
    Unavailable(String),
    #[error("register {0} is not readable")]
    Unreadable(u16),
    #[error("register {register} rejected value {value}")]
    WriteRejected { register: u16, value: i64 },
}

/// Opaque key/value register source polled by the Device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegisterSource: Send + Sync {
    /// Reads `count` registers starting at `start`.  Registers that do not
    /// exist are simply absent from the result.
    async fn read(
        &self,
        node_id: u8,
        start: u16,
        count: u16,
    ) -> Result<HashMap<u16, i64>, RegisterError>;

    async fn write(&self, node_id: u8, register: u16, value: i64) -> Result<(), RegisterError>;
}

/// Supplies the health byte (0–3).
pub trait HealthSource: Send + Sync {
    fn health(&self) -> u8;
}

impl<F> HealthSource for F
where
    F: Fn() -> u8 + Send + Sync,
{
    fn health(&self) -> u8 {
        self()
    }
}

/// A server connection as seen by the Device.
#[async_trait]
pub trait Link: Send + Sync {
    /// Human-readable name for log lines.
    fn label(&self) -> String;

    /// Connects; failures are logged and retried by [`Link::supervise`].
    async fn start(&self) -> bool;

    async fn stop(&self);

    /// Periodic health check; may reconnect.
    async fn supervise(&self);

    /// Sends a device-originated message.  With `await_ack` the call blocks
    /// until the server acknowledges or the ack timeout expires.
    async fn publish(&self, kind: MessageType, payload: &[u8], await_ack: bool) -> bool;
}

/// Device-side answers to server requests.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn health(&self) -> u8;

    /// DATA payload with current dataset values.
    fn data_payload(&self) -> Result<Vec<u8>, ProtocolError>;

    /// SETUP payload with the current setup map.
    fn setup_payload(&self) -> Result<Vec<u8>, ProtocolError>;

    /// Freezes the current dataset values and returns them as a LOG_DATA
    /// payload.  Each connection keeps its own frozen payload until its
    /// server asks for it.
    fn prepare_log(&self) -> Result<Vec<u8>, ProtocolError>;

    /// Starts a new accumulation interval.
    fn clear_log(&self);

    /// Applies a SETUP_CHANGE; entries that fail are logged and skipped.
    async fn apply_setup(&self, changes: SetupValues);
}
