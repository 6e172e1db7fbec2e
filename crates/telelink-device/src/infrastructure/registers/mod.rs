//! Register source implementations.
//!
//! Real field-bus drivers live outside this crate; [`memory`] backs the demo
//! binary and the tests.

pub mod memory;

pub use memory::MemoryRegisterSource;
