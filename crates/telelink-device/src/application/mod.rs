//! Application layer for the device.
//!
//! - **`ports`** – traits for the collaborators the Device is wired to at
//!   startup: register source, health source, server links.
//! - **`device`** – the Device itself: datasets, setup map, the register
//!   polling loop and the supervisory loop that keeps links healthy.

pub mod device;
pub mod ports;

pub use device::{Device, DeviceSettings};
pub use ports::{HealthSource, Link, MessageHandler, RegisterError, RegisterSource};
