//! Media layer errors

use thiserror::Error;

/// Errors from VAD configuration and the phrase cache.
#[derive(Debug, Error)]
pub enum MediaError {
    /// A detector or filter was configured with an out-of-range value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unrecognized detector selection string.
    #[error("unknown voice detection type {0:?}")]
    UnknownDetector(String),

    /// Phrase cache file I/O failure.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for media operations.
pub type Result<T> = std::result::Result<T, MediaError>;
