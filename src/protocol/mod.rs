//! Protocol module - Defines the messages modules exchange and their framing
//!
//! Each message is a line of text terminated by a NUL byte:
//! - Command:  `SOURCE NAME ["PARAMS"] @ID`
//! - Response: `SOURCE NAME ["PARAMS"] 1|0 @ID`

mod codec;
mod correlation;
mod message;

pub use codec::*;
pub use correlation::*;
pub use message::*;

/// Default port for module connections
pub const DEFAULT_PORT: u16 = 2300;

/// Byte terminating every frame on the wire
pub const FRAME_DELIMITER: u8 = 0x00;

/// Maximum frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
