use thiserror::Error;

use crate::cache::CacheError;
use crate::engine::EngineError;
use crate::session::SessionStatus;

/// Top-level error type for the karaoke-core public API.
#[derive(Debug, Error)]
pub enum KaraokeError {
    /// Source media could not be fetched or transcoded to PCM.
    #[error("decode failed: {0}")]
    Decode(String),

    /// PCM could not be encoded to the serving format.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Hardware/runtime fault that survived the one CPU retry.
    #[error("device failure: {0}")]
    Device(String),

    /// The separation engine failed for a non-device reason.
    #[error("separation failed: {0}")]
    Engine(String),

    /// The result cache cannot hold an entry even after full eviction.
    #[error("cache capacity exceeded: {0}")]
    Capacity(String),

    /// Status or result queried for an unknown track.
    #[error("unknown track `{0}`")]
    NotFound(String),

    /// A processing session ended in the error state.
    #[error("processing failed: {0}")]
    SessionFailed(String),

    #[error("timed out after {waited_ms}ms waiting for {what}")]
    Timeout { what: String, waited_ms: u64 },

    #[error("processing cancelled")]
    Cancelled,

    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("missing command `{command}` on PATH")]
    CommandMissing { command: String },

    #[error("command failed: `{command}` (status: {status}){stderr_suffix}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr_suffix: String,
    },

    #[error("command timed out after {timeout_ms}ms: `{command}`{stderr_suffix}")]
    CommandTimedOut {
        command: String,
        timeout_ms: u64,
        stderr_suffix: String,
    },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),
}

impl KaraokeError {
    #[must_use]
    pub fn from_command_failure(command: String, status: i32, stderr: &str) -> Self {
        Self::CommandFailed {
            command,
            status,
            stderr_suffix: stderr_suffix(stderr),
        }
    }

    #[must_use]
    pub fn from_command_timeout(command: String, timeout_ms: u64, stderr: &str) -> Self {
        Self::CommandTimedOut {
            command,
            timeout_ms,
            stderr_suffix: stderr_suffix(stderr),
        }
    }

    /// Stable machine-readable code used in JSON error envelopes.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "KARAOKE-DECODE",
            Self::Encode(_) => "KARAOKE-ENCODE",
            Self::Device(_) => "KARAOKE-DEVICE",
            Self::Engine(_) => "KARAOKE-ENGINE",
            Self::Capacity(_) => "KARAOKE-CAPACITY",
            Self::NotFound(_) => "KARAOKE-NOT-FOUND",
            Self::SessionFailed(_) => "KARAOKE-SESSION-FAILED",
            Self::Timeout { .. } => "KARAOKE-TIMEOUT",
            Self::Cancelled => "KARAOKE-CANCELLED",
            Self::InvalidTransition { .. } => "KARAOKE-INVALID-TRANSITION",
            Self::InvalidRequest(_) => "KARAOKE-INVALID-REQUEST",
            Self::CommandMissing { .. } => "KARAOKE-CMD-MISSING",
            Self::CommandFailed { .. } => "KARAOKE-CMD-FAILED",
            Self::CommandTimedOut { .. } => "KARAOKE-CMD-TIMEOUT",
            Self::Io(_) => "KARAOKE-IO",
            Self::Json(_) => "KARAOKE-JSON",
        }
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("; stderr: {trimmed}")
    }
}

impl From<EngineError> for KaraokeError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Device(msg) => KaraokeError::Device(msg),
            EngineError::Failed(msg) => KaraokeError::Engine(msg),
        }
    }
}

impl From<CacheError> for KaraokeError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Oversized { .. } => KaraokeError::Capacity(e.to_string()),
            CacheError::Io(e) => KaraokeError::Io(e),
            CacheError::Json(e) => KaraokeError::Json(e),
        }
    }
}

/// Convenience alias so callers can write `Result<T>` instead of `Result<T, KaraokeError>`.
pub type Result<T> = std::result::Result<T, KaraokeError>;
