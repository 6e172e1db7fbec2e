//! Infrastructure layer: sockets, register sources and configuration files.
//!
//! Everything here implements or feeds a port defined in
//! [`crate::application`].

pub mod network;
pub mod registers;
pub mod storage;
