//! # Live Session Errors
//!
//! The realtime voice pipeline distinguishes three failure families, and each
//! one is handled differently by the session:
//!
//! - **Permission**: the capture (or playback) device could not be opened.
//!   Reported from `connect()`; the session never leaves `Idle`.
//! - **Decode**: a single payload was not valid base64/PCM/JSON. Local and
//!   recoverable: the chunk is skipped and the session keeps running.
//! - **Transport**: the remote channel failed to open or dropped mid-session.
//!   Terminal for the session.

use std::fmt;

/// Tagged error for the realtime voice pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveError {
    /// Microphone (or output device) access denied or unavailable
    Permission(String),

    /// Malformed base64, PCM or protocol payload
    Decode(String),

    /// Channel open failure or mid-session disconnect
    Transport(String),
}

impl fmt::Display for LiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveError::Permission(msg) => write!(f, "Permission error: {}", msg),
            LiveError::Decode(msg) => write!(f, "Decode error: {}", msg),
            LiveError::Transport(msg) => write!(f, "Transport error: {}", msg),
        }
    }
}

impl std::error::Error for LiveError {}

impl From<base64::DecodeError> for LiveError {
    fn from(err: base64::DecodeError) -> Self {
        LiveError::Decode(format!("invalid base64: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LiveError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LiveError::Transport(err.to_string())
    }
}

/// Shorthand for results produced by the live pipeline.
pub type LiveResult<T> = Result<T, LiveError>;
