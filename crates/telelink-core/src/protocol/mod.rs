//! Protocol module containing the frame type, the binary codec and the
//! payload text format.

pub mod codec;
pub mod frame;
pub mod payload;

pub use codec::{decode_frame, encode_frame, FrameError, ProtocolError};
pub use frame::*;
