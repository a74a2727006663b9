//! Wire format spoken between the storage service and its controller.
//!
//! Every frame is laid out as
//!
//! ```text
//! "(BOM)\0" | size: u32 BE | signal: u32 BE | JSON payload | "(EOM)\0"
//! ```
//!
//! where `size` counts the signal field plus the payload bytes.

pub mod codec;
pub mod error;
pub mod frame;
pub mod signal;

pub use codec::{Message, decode, encode};
pub use error::{ProtocolError, Result};
pub use frame::FrameBuffer;
pub use signal::Signal;

pub const BEGIN_MARKER: &[u8; 6] = b"(BOM)\0";
pub const END_MARKER: &[u8; 6] = b"(EOM)\0";

/// Markers plus the size field.
pub const FRAME_OVERHEAD: usize = BEGIN_MARKER.len() + 4 + END_MARKER.len();
