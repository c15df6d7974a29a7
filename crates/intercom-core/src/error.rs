//! Engine error taxonomy
//!
//! Variants mirror how failures propagate: protocol errors are local to a
//! leg, capability failures retry inside the provider and surface here only
//! when terminal, bus failures abort the session, and invariant violations
//! are fatal for the session that raised them.

use thiserror::Error;

use porteiro_audiosocket::AudioSocketError;

/// Errors raised by the session engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed frame or identifier; closes the offending connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] AudioSocketError),

    /// Silence or absolute transaction budget exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// STT/TTS/LLM failure after the provider exhausted its retries.
    #[error("capability failure: {0}")]
    CapabilityTransient(String),

    /// Click-to-call bus transport failure. Always terminal for the
    /// session; there is deliberately no silent fallback.
    #[error("click-to-call bus failure: {0}")]
    BusFatal(String),

    /// Directory store unreachable.
    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// Session invariant violated (e.g. a second authorization decision).
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Unknown call or extension in a management request.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Media layer failure.
    #[error(transparent)]
    Media(#[from] porteiro_intercom_media::MediaError),

    /// Listener or snapshot I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot or payload (de)serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error is an expected close-time race rather than a
    /// fault (peer resets during hangup are logged at info level).
    pub fn is_expected_reset(&self) -> bool {
        matches!(self, EngineError::Protocol(e) if e.is_expected_reset())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
