//! AudioSocket protocol errors

use thiserror::Error;

/// Errors produced by the frame codec and connection layer.
///
/// Decoding is strict: any malformed header or payload is fatal for the
/// connection that produced it (`protocol_error` in the session taxonomy).
#[derive(Debug, Error)]
pub enum AudioSocketError {
    /// Unrecognized frame kind byte.
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),

    /// An ID frame payload must be exactly 16 bytes.
    #[error("ID frame payload has {0} bytes, expected 16")]
    InvalidIdLength(usize),

    /// An ERROR frame must carry at least the error code byte.
    #[error("ERROR frame carries no error code")]
    EmptyErrorPayload,

    /// The peer closed the stream at a frame boundary.
    #[error("connection closed by peer")]
    Closed,

    /// Transport failure while reading or writing a frame.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AudioSocketError {
    /// Connection resets during or after hangup are an expected race with
    /// the peer and are logged at info level rather than treated as faults.
    pub fn is_expected_reset(&self) -> bool {
        match self {
            AudioSocketError::Closed => true,
            AudioSocketError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type for AudioSocket operations.
pub type Result<T> = std::result::Result<T, AudioSocketError>;
