//! Pure telemetry domain: no I/O, no clocks other than the `Instant`s the
//! caller passes in.
//!
//! - **`dataset`** – per-register aggregates recomputed on every poll.
//! - **`setup`** – the externally visible configuration map and its
//!   reconciliation against hardware registers.
//! - **`register`** – one entry of a polled register snapshot.

pub mod dataset;
pub mod register;
pub mod setup;
