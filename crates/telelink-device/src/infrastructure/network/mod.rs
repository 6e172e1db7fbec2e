//! Network infrastructure: the TCP transport, transaction tracking and the
//! connection manager that ties them to the protocol.

pub mod connection_manager;
pub mod reliability;
pub mod transport;

pub use connection_manager::{ConnectionError, ConnectionManager, ConnectionSettings};
pub use reliability::{PendingState, ReliabilityTracker, CLEANUP_HORIZON};
pub use transport::{ConnectPolicy, TransportError};
