//! AudioSocket protocol support
//!
//! Implements the small binary framing spoken between the PBX and the
//! intercom service: a 1-byte kind, a big-endian 2-byte length, and an
//! opaque payload. Four kinds exist: ID (0x01, a 16-byte call identifier),
//! SLIN audio (0x10, signed 16-bit little-endian PCM at 8 kHz mono),
//! HANGUP (0x00, empty) and ERROR (0xff, error code plus detail).
//!
//! The codec never interprets audio samples; payloads are carried opaquely.

mod call_id;
mod conn;
mod error;
mod frame;

pub use call_id::CallId;
pub use conn::{split, FrameSink, FrameStream};
pub use error::{AudioSocketError, Result};
pub use frame::{Frame, KIND_AUDIO, KIND_ERROR, KIND_HANGUP, KIND_ID};

/// Sample rate of SLIN payloads.
pub const SAMPLE_RATE_HZ: u32 = 8000;

/// Nominal frame duration.
pub const FRAME_MS: u64 = 20;

/// Payload size of a nominal 20 ms SLIN frame (160 samples, 2 bytes each).
pub const SLIN_FRAME_BYTES: usize = 320;
