//! Register snapshot entries.

use std::time::Instant;

/// One register value as captured by a poll.  The whole snapshot is
/// replaced on every successful poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Register {
    pub register_id: u16,
    pub value: i64,
    pub captured_at: Instant,
}
