//! # telelink-core
//!
//! Shared library for the Telelink device protocol containing the frame
//! codec, the payload cipher, device identity and the telemetry aggregation
//! domain.
//!
//! It has no dependencies on sockets or an async runtime; the
//! `telelink-device` crate supplies the network and scheduling layers.
//!
//! # Architecture overview
//!
//! A field device keeps one long-lived TCP connection per server.  Every
//! message travels as a *frame*: a fixed 32-byte header followed by an
//! encrypted payload.
//!
//! - **`protocol`** – the wire format.  [`protocol::Frame`] is the decoded
//!   header plus ciphertext; [`protocol::codec`] turns frames into bytes and
//!   back; [`protocol::payload`] holds the key/value text carried inside.
//!
//! - **`crypto`** – [`crypto::CryptoBox`] seals payload text with a
//!   64-bit block cipher (XTEA by default) in CBC mode and a fresh IV per
//!   message.
//!
//! - **`identity`** – serial number, shared key and server address of one
//!   connection, validated once at construction.
//!
//! - **`domain`** – datasets (instant, average, integral aggregates of
//!   polled register values) and the setup map that mirrors device
//!   configuration into hardware registers.

pub mod crypto;
pub mod domain;
pub mod identity;
pub mod protocol;

pub use crypto::{CipherKind, CryptoBox, CryptoError, Sealed};
pub use domain::dataset::{Dataset, DatasetKind};
pub use domain::register::Register;
pub use domain::setup::{SetupAction, SetupEntry, SetupMap};
pub use identity::{ConfigurationError, Identity};
pub use protocol::codec::{decode_frame, encode_frame, FrameError, ProtocolError};
pub use protocol::frame::{Frame, MessageType};
