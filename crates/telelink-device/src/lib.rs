//! telelink-device library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! A device keeps a long-lived, self-healing TCP connection to each of its
//! servers:
//!
//! 1. The [`infrastructure::network::ConnectionManager`] connects, pushes the
//!    device setup and answers server requests (data, setup changes, log
//!    snapshots) through the Device.
//! 2. Every outbound report is encrypted, framed and, unless it is a
//!    response, held until the server ACKs its transaction id.
//! 3. The [`application::Device`] polls a register source, aggregates the
//!    readings into datasets and keeps the setup map in step with the
//!    hardware.
//! 4. A supervisory loop ticks each connection's watchdog, which reconnects
//!    dropped or silent links.

/// Application layer: the Device and the ports it is wired through.
pub mod application;

/// Infrastructure layer: network, register sources and configuration.
pub mod infrastructure;
